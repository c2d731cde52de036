//! `aim` - AIM engine command line

use clap::Parser;

use aim_common::telemetry::init_telemetry;
use aim_common::{Error, Result};
use aim_engine::cli::Cli;
use aim_engine::EngineConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::resolve(cli.config.as_deref())?;

    init_telemetry(config.telemetry_config(cli.json_logs))
        .map_err(|e| Error::config(e.to_string()))?;

    cli.run(config).await
}
