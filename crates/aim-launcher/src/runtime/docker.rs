//! Containers through the Docker CLI.

use std::time::Duration;

use aim_common::process::run_command;
use aim_common::quantity::deserialize_duration;
use aim_common::LaunchError;
use aim_recipe::GpuVendor;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Runtime, RuntimeHandle, RuntimeKind};
use crate::spec::LaunchSpec;

const RUNTIME: &str = "container";

/// Docker CLI settings
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    /// CLI binary
    pub cli: String,
    /// Shared memory for tensor-parallel workers
    pub shm_size: String,
    /// Upper bound on one CLI call (image pulls happen inside `run`)
    #[serde(deserialize_with = "deserialize_duration")]
    pub command_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            cli: "docker".to_string(),
            shm_size: "16g".to_string(),
            command_timeout: Duration::from_secs(600),
        }
    }
}

/// Runs each instance as a detached container with the cache mounted.
#[derive(Clone, Debug, Default)]
pub struct DockerRuntime {
    config: DockerConfig,
}

impl DockerRuntime {
    /// Create a runtime with the given CLI settings
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    async fn docker(&self, handle_name: &str, args: &[String], what: &str) -> Result<String, LaunchError> {
        let mut cmd = Command::new(&self.config.cli);
        cmd.args(args);
        run_command(&mut cmd, self.config.command_timeout, what)
            .await
            .map(|out| out.stdout.trim().to_string())
            .map_err(|e| LaunchError::runtime(RUNTIME, handle_name, format!("{what}: {e}")))
    }
}

/// Arguments for `docker run`, without the CLI binary
pub fn run_args(spec: &LaunchSpec, shm_size: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        spec.name.clone(),
        "-p".into(),
        format!("{}:{}", spec.port, spec.port),
        "--ipc=host".into(),
        format!("--shm-size={shm_size}"),
        "--label".into(),
        format!("app.kubernetes.io/managed-by={}", aim_common::INSTANCE_NAME_PREFIX),
    ];

    match spec.vendor {
        GpuVendor::Amd => {
            args.extend([
                "--device=/dev/kfd".to_string(),
                "--device=/dev/dri".to_string(),
                "--group-add=video".to_string(),
                "--cap-add=SYS_PTRACE".to_string(),
                "--security-opt=seccomp=unconfined".to_string(),
            ]);
        }
        GpuVendor::Nvidia => {
            args.push("--gpus".into());
            args.push(spec.gpu_count.to_string());
        }
        GpuVendor::Unknown => {}
    }

    for volume in &spec.volumes {
        args.push("-v".into());
        args.push(format!("{}:{}", volume.host_path.display(), volume.container_path));
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Parse `docker inspect` output of `{{.State.Running}} {{.State.ExitCode}}`
fn parse_state(output: &str) -> Option<Option<i32>> {
    let mut parts = output.split_whitespace();
    let running = parts.next()?;
    let code: i32 = parts.next()?.parse().ok()?;
    match running {
        "true" => Some(None),
        "false" => Some(Some(code)),
        _ => None,
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Container
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, LaunchError> {
        let args = run_args(spec, &self.config.shm_size);
        info!(name = %spec.name, image = %spec.image, command = %spec.command_line(), "Starting container");
        let id = self.docker(&spec.name, &args, "docker run").await?;
        let id: String = id.lines().last().unwrap_or_default().chars().take(12).collect();
        info!(name = %spec.name, container = %id, "Container started");
        Ok(RuntimeHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn endpoint(&self, _handle: &RuntimeHandle, port: u16) -> Result<Option<String>, LaunchError> {
        Ok(Some(format!("http://127.0.0.1:{port}")))
    }

    async fn exit_code(&self, handle: &RuntimeHandle) -> Result<Option<i32>, LaunchError> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}} {{.State.ExitCode}}".to_string(),
            handle.name.clone(),
        ];
        let out = self.docker(&handle.name, &args, "docker inspect").await?;
        parse_state(&out).ok_or_else(|| {
            LaunchError::runtime(RUNTIME, &handle.name, format!("unexpected inspect output: {out}"))
        })
    }

    async fn terminate(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        let args = [
            "kill".to_string(),
            "--signal=SIGTERM".to_string(),
            handle.name.clone(),
        ];
        self.docker(&handle.name, &args, "docker kill --signal=SIGTERM").await?;
        debug!(name = %handle.name, "Sent SIGTERM to container");
        Ok(())
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        let args = ["kill".to_string(), handle.name.clone()];
        self.docker(&handle.name, &args, "docker kill").await.map(|_| ())
    }

    async fn release(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        let args = ["rm".to_string(), "-f".to_string(), handle.name.clone()];
        self.docker(&handle.name, &args, "docker rm").await?;
        debug!(name = %handle.name, "Removed container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::VolumeMount;
    use aim_recipe::Resources;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec(vendor: GpuVendor) -> LaunchSpec {
        LaunchSpec {
            name: "aim-engine-qwen-qwen3-32b-4gpu-bf16-vllm-1a2b3c4d".to_string(),
            image: "rocm/vllm:latest".to_string(),
            command: vec!["python".into(), "-m".into(), "vllm.entrypoints.openai.api_server".into()],
            env: BTreeMap::from([("VLLM_USE_BF16".to_string(), "1".to_string())]),
            volumes: vec![VolumeMount {
                host_path: PathBuf::from("/data/cache"),
                container_path: "/workspace/model-cache".to_string(),
            }],
            port: 8001,
            gpu_count: 4,
            vendor,
            resources: Resources::default(),
            model_path: "/workspace/model-cache/models/Qwen--Qwen3-32B".to_string(),
        }
    }

    #[test]
    fn amd_containers_get_rocm_devices() {
        let args = run_args(&spec(GpuVendor::Amd), "16g");
        assert!(args.contains(&"--device=/dev/kfd".to_string()));
        assert!(args.contains(&"--device=/dev/dri".to_string()));
        assert!(args.contains(&"--group-add=video".to_string()));
        assert!(!args.contains(&"--gpus".to_string()));
    }

    #[test]
    fn nvidia_containers_request_gpus() {
        let args = run_args(&spec(GpuVendor::Nvidia), "16g");
        let pos = args.iter().position(|a| a == "--gpus").unwrap();
        assert_eq!(args[pos + 1], "4");
    }

    #[test]
    fn run_args_map_port_volume_env_then_image_and_command() {
        let args = run_args(&spec(GpuVendor::Amd), "16g");
        let window = |a: &str, b: &str| args.windows(2).any(|w| w[0] == a && w[1] == b);
        assert!(window("-p", "8001:8001"));
        assert!(window("-v", "/data/cache:/workspace/model-cache"));
        assert!(window("-e", "VLLM_USE_BF16=1"));

        let image = args.iter().position(|a| a == "rocm/vllm:latest").unwrap();
        assert_eq!(args[image + 1..], ["python", "-m", "vllm.entrypoints.openai.api_server"]);
    }

    #[test]
    fn inspect_output_parsing() {
        assert_eq!(parse_state("true 0\n"), Some(None));
        assert_eq!(parse_state("false 137"), Some(Some(137)));
        assert_eq!(parse_state("garbage"), None);
    }
}
