//! `aim` command line.

use std::path::PathBuf;

use aim_common::quantity::format_gib;
use aim_common::{Error, Result};
use aim_launcher::LaunchRequest;
use aim_recipe::{Backend, HardwareProfile, Precision, SelectionConstraints};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::engine::Engine;

/// AIM engine - recipe-driven LLM serving on GPU hosts
#[derive(Parser, Debug)]
#[command(name = "aim", version, about, long_about = None)]
pub struct Cli {
    /// Engine configuration file (YAML or JSON)
    #[arg(short, long, env = "AIM_ENGINE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Output format
    #[arg(short, long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    /// Columnar table (default)
    #[default]
    Table,
    /// JSON
    Json,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve the recipe a launch would use, without launching
    Select(SelectArgs),
    /// List every enabled configuration of a model
    Configs {
        /// Model id, e.g. Qwen/Qwen3-32B
        model: String,
    },
    /// Show the detected hardware
    Hardware,
    /// Launch a model and serve until interrupted
    Launch(LaunchArgs),
    /// Inspect and manage the model cache
    Cache {
        /// Cache operation
        #[command(subcommand)]
        command: CacheCommand,
    },
}

/// Optional pins shared by `select` and `launch`
#[derive(Args, Debug, Default)]
pub struct ConstraintArgs {
    /// Exact GPU count
    #[arg(long)]
    pub gpus: Option<u32>,
    /// Exact precision (fp16, bf16, fp8, int8, int4)
    #[arg(long)]
    pub precision: Option<Precision>,
    /// Exact backend (vllm, sglang)
    #[arg(long)]
    pub backend: Option<Backend>,
}

impl ConstraintArgs {
    fn constraints(&self) -> SelectionConstraints {
        SelectionConstraints {
            gpu_count: self.gpus,
            precision: self.precision,
            backend: self.backend,
        }
    }
}

/// `aim select`
#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Model id
    pub model: String,
    /// Selection pins
    #[command(flatten)]
    pub constraints: ConstraintArgs,
    /// Declared accelerator count instead of detection
    #[arg(long, requires = "arch")]
    pub accelerators: Option<u32>,
    /// Declared architecture, e.g. MI300X
    #[arg(long)]
    pub arch: Option<String>,
}

/// `aim launch`
#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Model id
    pub model: String,
    /// Selection pins
    #[command(flatten)]
    pub constraints: ConstraintArgs,
    /// Serving port
    #[arg(short, long)]
    pub port: Option<u16>,
}

/// `aim cache ...`
#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Usage summary
    Stats,
    /// Every entry with size, priority, and pins
    List,
    /// Remove one model
    Remove {
        /// Model id
        model: String,
    },
    /// Remove unpinned entries past their retention deadline
    Purge,
    /// Register a local directory as a model
    Add {
        /// Model id
        model: String,
        /// Directory (or file) to copy in
        path: PathBuf,
    },
}

impl Cli {
    /// Run the command against an engine built from `config`
    pub async fn run(self, config: EngineConfig) -> Result<()> {
        let engine = Engine::from_config(&config).await?;
        let output = self.output;
        match self.command {
            Commands::Select(args) => select(&engine, args, output).await,
            Commands::Configs { model } => configs(&engine, &model, output),
            Commands::Hardware => {
                let profile = engine.hardware().await;
                match output {
                    OutputFormat::Json => print_json(&profile),
                    OutputFormat::Table => {
                        print_hardware(&profile);
                        Ok(())
                    }
                }
            }
            Commands::Launch(args) => launch(&engine, args).await,
            Commands::Cache { command } => cache(&engine, command, output).await,
        }
    }
}

async fn select(engine: &Engine, args: SelectArgs, output: OutputFormat) -> Result<()> {
    let declared = args
        .accelerators
        .map(|count| HardwareProfile::new(count, args.arch.as_deref()));
    let resolved = engine
        .select(&args.model, &args.constraints.constraints(), declared)
        .await?;

    match output {
        OutputFormat::Json => print_json(&resolved),
        OutputFormat::Table => {
            let auto = |flag: bool| if flag { " (auto)" } else { "" };
            println!("Recipe:     {}", resolved.recipe_id);
            println!("Model:      {}", resolved.model_id);
            println!("Hardware:   {}", resolved.hardware);
            println!(
                "Precision:  {}{}",
                resolved.precision,
                auto(resolved.auto_selected.precision)
            );
            println!(
                "Backend:    {}{}",
                resolved.backend,
                auto(resolved.auto_selected.backend)
            );
            println!(
                "GPUs:       {}{}",
                resolved.gpu_count,
                auto(resolved.auto_selected.gpu_count)
            );
            let args = resolved
                .launch_config
                .render_args(aim_common::DEFAULT_SERVING_PORT);
            println!("Arguments:  {}", args.join(" "));
            Ok(())
        }
    }
}

fn configs(engine: &Engine, model: &str, output: OutputFormat) -> Result<()> {
    let configs = engine.supported_configurations(model);
    if configs.is_empty() {
        return Err(aim_common::ResolutionError::ModelNotFound {
            model_id: model.to_string(),
        }
        .into());
    }
    match output {
        OutputFormat::Json => print_json(&configs),
        OutputFormat::Table => {
            let rows: Vec<Vec<String>> = configs
                .iter()
                .map(|c| {
                    vec![
                        c.recipe_id.clone(),
                        c.hardware.clone(),
                        c.precision.to_string(),
                        c.backend.to_string(),
                        c.gpu_count.to_string(),
                    ]
                })
                .collect();
            print_table(&["RECIPE", "HARDWARE", "PRECISION", "BACKEND", "GPUS"], &rows);
            Ok(())
        }
    }
}

async fn launch(engine: &Engine, args: LaunchArgs) -> Result<()> {
    let request = LaunchRequest {
        model_id: args.model,
        constraints: args.constraints.constraints(),
        port: args.port,
    };
    let handle = engine.launch(request).await?;
    let id = handle.instance_id.clone();
    println!(
        "Starting {id}: {} on {} GPU(s), {} {}",
        handle.resolved.recipe_id,
        handle.resolved.gpu_count,
        handle.resolved.backend,
        handle.resolved.precision
    );

    let ready = tokio::select! {
        ready = handle.wait_ready() => ready,
        _ = tokio::signal::ctrl_c() => {
            info!(instance_id = %id, "Interrupted while starting");
            engine.stop(&id).await?;
            return Ok(());
        }
    };
    let status = match ready {
        Ok(status) => status,
        Err(e) => {
            engine.shutdown().await;
            return Err(e.into());
        }
    };

    println!(
        "Ready at {} (Ctrl-C to stop)",
        status.endpoint.as_deref().unwrap_or("-")
    );
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C, stopping now");
    }
    engine.stop(&id).await?;
    println!("Stopped {id}");
    Ok(())
}

async fn cache(engine: &Engine, command: CacheCommand, output: OutputFormat) -> Result<()> {
    match command {
        CacheCommand::Stats => {
            let stats = engine.cache_stats().await;
            match output {
                OutputFormat::Json => print_json(&stats),
                OutputFormat::Table => {
                    println!("Root:      {}", stats.root.display());
                    println!(
                        "Used:      {} of {}",
                        format_gib(stats.total_bytes),
                        format_gib(stats.capacity_bytes)
                    );
                    println!("Entries:   {}", stats.entry_count);
                    Ok(())
                }
            }
        }
        CacheCommand::List => {
            let entries = engine.cache().list().await;
            match output {
                OutputFormat::Json => print_json(&entries),
                OutputFormat::Table => {
                    let rows: Vec<Vec<String>> = entries
                        .iter()
                        .map(|e| {
                            vec![
                                e.entry.model_id.clone(),
                                format_gib(e.entry.size_bytes),
                                e.entry.priority.to_string(),
                                e.pins.to_string(),
                                format_age(&e.entry.last_access),
                            ]
                        })
                        .collect();
                    print_table(&["MODEL", "SIZE", "PRIORITY", "PINS", "LAST ACCESS"], &rows);
                    Ok(())
                }
            }
        }
        CacheCommand::Remove { model } => {
            engine.cache_remove(&model).await?;
            println!("Removed {model}");
            Ok(())
        }
        CacheCommand::Purge => {
            let removed = engine.cache().purge_expired().await?;
            if removed.is_empty() {
                println!("Nothing expired");
            }
            for model in removed {
                println!("Purged {model}");
            }
            Ok(())
        }
        CacheCommand::Add { model, path } => {
            let dest = engine.cache().add_local(&model, &path).await?;
            println!("Added {model} at {}", dest.display());
            Ok(())
        }
    }
}

// =============================================================================
// Formatting
// =============================================================================

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::validation(format!("json serialization failed: {e}")))?;
    println!("{json}");
    Ok(())
}

fn print_hardware(profile: &HardwareProfile) {
    println!("Vendor:        {}", profile.vendor);
    println!("Accelerators:  {}", profile.accelerator_count);
    println!(
        "Architecture:  {}",
        profile.architecture.as_deref().unwrap_or("unknown")
    );
    println!(
        "Memory/GPU:    {}",
        profile
            .memory_per_accelerator_bytes
            .map(format_gib)
            .unwrap_or_else(|| "unknown".to_string())
    );
}

/// Age as `2d`, `5h`, `30m`, `15s`
fn format_age(timestamp: &DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(*timestamp);
    if duration.num_seconds() < 0 {
        return "0s".to_string();
    }
    if duration.num_days() > 0 {
        return format!("{}d", duration.num_days());
    }
    if duration.num_hours() > 0 {
        return format!("{}h", duration.num_hours());
    }
    if duration.num_minutes() > 0 {
        return format!("{}m", duration.num_minutes());
    }
    format!("{}s", duration.num_seconds())
}

/// Column-aligned table with headers
fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    println!("{}", line(headers.to_vec()));
    for row in rows {
        println!("{}", line(row.iter().map(String::as_str).collect()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_flags_parse_into_constraints() {
        let cli = Cli::try_parse_from([
            "aim", "launch", "Qwen/Qwen3-32B", "--gpus", "4", "--precision", "bf16", "--backend",
            "vllm", "--port", "8001", "-o", "json",
        ])
        .unwrap();
        let Commands::Launch(args) = cli.command else {
            panic!("expected launch");
        };
        assert_eq!(args.port, Some(8001));
        let constraints = args.constraints.constraints();
        assert_eq!(constraints.gpu_count, Some(4));
        assert_eq!(constraints.precision, Some(Precision::Bf16));
        assert_eq!(constraints.backend, Some(Backend::Vllm));
        assert!(matches!(cli.output, OutputFormat::Json));
    }

    #[test]
    fn unknown_precision_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["aim", "select", "m", "--precision", "fp64"]).is_err());
    }

    #[test]
    fn declared_accelerators_require_an_architecture() {
        assert!(Cli::try_parse_from(["aim", "select", "m", "--accelerators", "8"]).is_err());
        assert!(
            Cli::try_parse_from(["aim", "select", "m", "--accelerators", "8", "--arch", "MI300X"])
                .is_ok()
        );
    }

    #[test]
    fn cache_subcommands() {
        let cli = Cli::try_parse_from(["aim", "cache", "add", "org/model", "/tmp/model"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache {
                command: CacheCommand::Add { .. }
            }
        ));
    }

    #[test]
    fn ages() {
        assert_eq!(format_age(&(Utc::now() - chrono::Duration::hours(50))), "2d");
        assert_eq!(format_age(&(Utc::now() + chrono::Duration::hours(1))), "0s");
    }
}
