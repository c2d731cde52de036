//! Launch Orchestrator for the AIM engine.
//!
//! Turns a launch request into a running inference server: select a recipe,
//! pin the model artifact, start the workload on a [`Runtime`], and poll its
//! health endpoint until it is ready. Each instance moves through the
//! [`LifecycleState`] machine and releases its port and cache pin exactly
//! once when it leaves the active states.

#![deny(missing_docs)]

pub mod health;
pub mod instance;
pub mod orchestrator;
pub mod runtime;
pub mod spec;

pub use health::{HealthProbe, HttpHealthProbe, DEFAULT_HEALTH_PATH};
pub use instance::{InstanceStatus, LifecycleState};
pub use orchestrator::{LaunchHandle, LaunchRequest, Orchestrator, OrchestratorConfig};
pub use runtime::{
    build_pod, DockerConfig, DockerRuntime, KubernetesConfig, KubernetesPodRuntime,
    LocalProcessRuntime, Runtime, RuntimeHandle, RuntimeKind,
};
pub use spec::{build_launch_spec, CacheLayout, LaunchSpec, VolumeMount};
