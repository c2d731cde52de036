//! Instance records and the lifecycle state machine.

use std::path::PathBuf;

use aim_common::Error;
use aim_recipe::{Backend, Precision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::{RuntimeHandle, RuntimeKind};

/// Lifecycle of one served model.
///
/// ```text
/// Pending → Starting → Running → Stopping → Stopped
///              │          │         ▲
///              └──────────┴→ Failed ┘
/// ```
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Resolving the recipe and materializing the artifact
    Pending,
    /// Process started; health checks in progress
    Starting,
    /// Health check passed
    Running,
    /// Stop requested; waiting for the process to exit
    Stopping,
    /// Stopped cleanly (terminal)
    Stopped,
    /// Crashed or never became healthy (terminal until stopped)
    Failed,
}

impl LifecycleState {
    /// All states, in lifecycle order
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Failed,
    ];

    /// Whether `self → to` is an edge of the state machine
    pub fn can_transition_to(self, to: Self) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Pending, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Failed, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// True for states that hold a port and a cache pin
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Starting | Self::Running | Self::Stopping)
    }

    /// Lowercase label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                Error::validation(format!(
                    "invalid lifecycle state: {s}, expected one of: pending, starting, running, stopping, stopped, failed"
                ))
            })
    }
}

/// Read-only snapshot of an instance
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InstanceStatus {
    /// Engine-assigned id
    pub instance_id: String,
    /// Model being served
    pub model_id: String,
    /// Recipe the launch resolved to
    pub recipe_id: String,
    /// Serving backend
    pub backend: Backend,
    /// Precision of the recipe
    pub precision: Precision,
    /// GPUs allocated
    pub gpu_count: u32,
    /// Serving port
    pub port: u16,
    /// Base URL of the server, once known
    pub endpoint: Option<String>,
    /// Where the model artifact lives on the host
    pub model_path: PathBuf,
    /// Current lifecycle state
    pub state: LifecycleState,
    /// Runtime the instance was started on
    pub runtime: RuntimeKind,
    /// Process id, container id, or pod name
    pub external_handle: Option<String>,
    /// Why the instance failed, if it did
    pub error: Option<String>,
    /// When the launch was requested
    pub created_at: DateTime<Utc>,
    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl InstanceStatus {
    pub(crate) fn set_handle(&mut self, handle: &RuntimeHandle) {
        self.external_handle = Some(handle.id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn forward_path_is_allowed() {
        assert!(Pending.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn stopped_is_only_reached_through_stopping() {
        for from in LifecycleState::ALL {
            assert_eq!(from.can_transition_to(Stopped), from == Stopping, "{from} -> stopped");
        }
    }

    #[test]
    fn failure_only_from_starting_or_running() {
        assert!(Starting.can_transition_to(Failed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Stopping.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(Failed));
    }

    #[test]
    fn stopped_is_terminal() {
        for to in LifecycleState::ALL {
            assert!(!Stopped.can_transition_to(to), "stopped -> {to}");
        }
        assert!(!Stopped.is_active());
        assert!(!Failed.is_active());
    }

    #[test]
    fn parse_and_display() {
        for state in LifecycleState::ALL {
            assert_eq!(state.to_string().parse::<LifecycleState>().unwrap(), state);
        }
        assert!("crashed".parse::<LifecycleState>().is_err());
    }
}
