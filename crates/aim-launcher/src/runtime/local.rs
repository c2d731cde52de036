//! Child processes on the local host.

use std::process::Stdio;
use std::time::Duration;

use aim_common::process::run_command;
use aim_common::LaunchError;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{Runtime, RuntimeHandle, RuntimeKind};
use crate::spec::LaunchSpec;

const RUNTIME: &str = "local-process";

/// Runs the server command directly, inheriting stdout and stderr.
#[derive(Debug, Default)]
pub struct LocalProcessRuntime {
    children: DashMap<String, Child>,
}

impl LocalProcessRuntime {
    /// Create an empty runtime
    pub fn new() -> Self {
        Self::default()
    }

    fn error(handle: &RuntimeHandle, msg: impl Into<String>) -> LaunchError {
        LaunchError::runtime(RUNTIME, &handle.name, msg)
    }
}

#[async_trait]
impl Runtime for LocalProcessRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::LocalProcess
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, LaunchError> {
        let mut cmd = Command::new(spec.program());
        cmd.args(spec.args())
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| LaunchError::runtime(RUNTIME, &spec.name, format!("spawn failed: {e}")))?;
        let pid = child
            .id()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "exited".to_string());

        info!(name = %spec.name, pid = %pid, command = %spec.command_line(), "Started local process");
        self.children.insert(spec.name.clone(), child);
        Ok(RuntimeHandle {
            id: pid,
            name: spec.name.clone(),
        })
    }

    async fn endpoint(&self, _handle: &RuntimeHandle, port: u16) -> Result<Option<String>, LaunchError> {
        Ok(Some(format!("http://127.0.0.1:{port}")))
    }

    async fn exit_code(&self, handle: &RuntimeHandle) -> Result<Option<i32>, LaunchError> {
        let mut child = self
            .children
            .get_mut(&handle.name)
            .ok_or_else(|| Self::error(handle, "process is not tracked"))?;
        let status = child
            .try_wait()
            .map_err(|e| Self::error(handle, format!("wait failed: {e}")))?;
        // Killed by a signal reports no code
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    async fn terminate(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        if self.exit_code(handle).await?.is_some() {
            return Ok(());
        }
        let mut cmd = Command::new("kill");
        cmd.arg("-TERM").arg(&handle.id);
        run_command(&mut cmd, Duration::from_secs(5), "kill -TERM")
            .await
            .map_err(|e| Self::error(handle, e))?;
        debug!(name = %handle.name, pid = %handle.id, "Sent SIGTERM");
        Ok(())
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        let mut child = self
            .children
            .get_mut(&handle.name)
            .ok_or_else(|| Self::error(handle, "process is not tracked"))?;
        child
            .start_kill()
            .map_err(|e| Self::error(handle, format!("kill failed: {e}")))
    }

    async fn release(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        if let Some((_, mut child)) = self.children.remove(&handle.name) {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.start_kill();
            }
            let _ = child.wait().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_recipe::{GpuVendor, Resources};
    use std::collections::BTreeMap;

    fn spec(name: &str, script: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            image: String::new(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            volumes: Vec::new(),
            port: 8000,
            gpu_count: 0,
            vendor: GpuVendor::Unknown,
            resources: Resources::default(),
            model_path: String::new(),
        }
    }

    async fn wait_exit(runtime: &LocalProcessRuntime, handle: &RuntimeHandle) -> i32 {
        for _ in 0..100 {
            if let Some(code) = runtime.exit_code(handle).await.unwrap() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process did not exit");
    }

    #[tokio::test]
    async fn reports_exit_codes() {
        let runtime = LocalProcessRuntime::new();
        let handle = runtime.start(&spec("exit-3", "exit 3")).await.unwrap();
        assert_eq!(wait_exit(&runtime, &handle).await, 3);
        runtime.release(&handle).await.unwrap();
        assert!(runtime.exit_code(&handle).await.is_err());
    }

    #[tokio::test]
    async fn terminate_stops_a_running_process() {
        let runtime = LocalProcessRuntime::new();
        let handle = runtime.start(&spec("sleeper", "sleep 30")).await.unwrap();
        assert_eq!(runtime.exit_code(&handle).await.unwrap(), None);

        runtime.terminate(&handle).await.unwrap();
        assert_eq!(wait_exit(&runtime, &handle).await, -1);
        runtime.release(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let runtime = LocalProcessRuntime::new();
        let mut bad = spec("bad", "");
        bad.command = vec!["definitely-not-a-real-binary".to_string()];
        assert!(matches!(
            runtime.start(&bad).await,
            Err(LaunchError::Runtime { .. })
        ));
    }
}
