//! Runtime capability: where server processes actually run.
//!
//! The orchestrator is written once against [`Runtime`]; the deployment
//! target is picked by configuration.

mod docker;
mod kubernetes;
mod local;

pub use docker::{DockerConfig, DockerRuntime};
pub use kubernetes::{build_pod, KubernetesConfig, KubernetesPodRuntime};
pub use local::LocalProcessRuntime;

use aim_common::{Error, LaunchError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::spec::LaunchSpec;

/// Deployment target
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// Child process on this host
    LocalProcess,
    /// Container via the Docker CLI
    #[default]
    Container,
    /// Pod in a Kubernetes cluster
    KubernetesPod,
}

impl RuntimeKind {
    /// Whether the cache root is mounted at the container cache path
    pub fn mounts_cache(self) -> bool {
        !matches!(self, Self::LocalProcess)
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalProcess => write!(f, "local-process"),
            Self::Container => write!(f, "container"),
            Self::KubernetesPod => write!(f, "kubernetes-pod"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "local-process" | "process" => Ok(Self::LocalProcess),
            "container" | "docker" => Ok(Self::Container),
            "kubernetes" | "kubernetes-pod" | "k8s" | "pod" => Ok(Self::KubernetesPod),
            _ => Err(Error::validation(format!(
                "invalid runtime: {s}, expected one of: local-process, container, kubernetes-pod"
            ))),
        }
    }
}

/// Opaque reference to a started workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeHandle {
    /// Process id, container id, or pod name
    pub id: String,
    /// Name the workload was started under
    pub name: String,
}

/// Starts, observes, and stops server workloads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Which deployment target this is
    fn kind(&self) -> RuntimeKind;

    /// Start the workload; returns once it has been created, not when ready
    async fn start(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, LaunchError>;

    /// Base URL the server should answer on, if it is known yet
    async fn endpoint(&self, handle: &RuntimeHandle, port: u16) -> Result<Option<String>, LaunchError>;

    /// Exit code once the workload has exited; None while it is running
    async fn exit_code(&self, handle: &RuntimeHandle) -> Result<Option<i32>, LaunchError>;

    /// Ask the workload to shut down gracefully
    async fn terminate(&self, handle: &RuntimeHandle) -> Result<(), LaunchError>;

    /// Force the workload down
    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), LaunchError>;

    /// Remove whatever the runtime keeps after exit (containers, pods)
    async fn release(&self, handle: &RuntimeHandle) -> Result<(), LaunchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kind_parses_aliases() {
        assert_eq!("docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Container);
        assert_eq!("k8s".parse::<RuntimeKind>().unwrap(), RuntimeKind::KubernetesPod);
        assert_eq!(
            "local-process".parse::<RuntimeKind>().unwrap(),
            RuntimeKind::LocalProcess
        );
        assert!("vm".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn only_local_processes_use_host_paths() {
        assert!(!RuntimeKind::LocalProcess.mounts_cache());
        assert!(RuntimeKind::Container.mounts_cache());
        assert!(RuntimeKind::KubernetesPod.mounts_cache());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for kind in [
            RuntimeKind::LocalProcess,
            RuntimeKind::Container,
            RuntimeKind::KubernetesPod,
        ] {
            assert_eq!(kind.to_string().parse::<RuntimeKind>().unwrap(), kind);
        }
    }
}
