//! Error types for the AIM engine
//!
//! Errors are structured with fields so callers can decide on remediation
//! without parsing messages. Each component owns one taxonomy:
//!
//! - [`ResolutionError`] - recipe selection failures (deterministic, never retried)
//! - [`CacheError`] - artifact cache failures
//! - [`LaunchError`] - instance lifecycle failures
//! - [`CatalogError`] - recipe catalog rejected at load time
//!
//! [`Error`] wraps all of them for the engine facade.

use std::path::PathBuf;

use thiserror::Error;

/// Recipe selection failure
///
/// Selection is a pure function of its inputs, so none of these are retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    /// The request itself is malformed (e.g. empty model id)
    #[error("invalid selection request: {message}")]
    InvalidRequest {
        /// Description of what's invalid
        message: String,
    },

    /// The catalog has no recipe at all for this model
    #[error("no recipe found for model {model_id}")]
    ModelNotFound {
        /// Requested model id
        model_id: String,
    },

    /// No candidate recipe has a usable GPU-count entry
    #[error(
        "no enabled GPU configuration for model {model_id} (requested: {}, available: {available})",
        .requested.map(|n| n.to_string()).unwrap_or_else(|| "auto".to_string())
    )]
    NoMatchingGpuCount {
        /// Requested model id
        model_id: String,
        /// GPU count pinned by the caller, if any
        requested: Option<u32>,
        /// Accelerators reported by the hardware profile (0 = unknown)
        available: u32,
        /// Recipe ids that were considered
        candidates: Vec<String>,
    },

    /// A caller constraint or the hardware filter left zero recipes
    #[error("no recipe for model {model_id} satisfies {constraint}={value}")]
    ConstraintConflict {
        /// Requested model id
        model_id: String,
        /// Which constraint emptied the candidate set (precision, backend, hardware)
        constraint: String,
        /// The value that matched nothing
        value: String,
    },
}

impl ResolutionError {
    /// Create an invalid-request error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    /// Resolution errors are never retryable
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Artifact cache failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The artifact cannot fit even after evicting every evictable entry
    #[error(
        "cache capacity exceeded for {model_id}: need {requested_bytes} bytes, capacity {capacity_bytes}, reclaimable {reclaimable_bytes}"
    )]
    CapacityExceeded {
        /// Model being materialized
        model_id: String,
        /// Size of the incoming artifact
        requested_bytes: u64,
        /// Configured capacity
        capacity_bytes: u64,
        /// Bytes free plus bytes held by evictable entries
        reclaimable_bytes: u64,
    },

    /// The external fetcher failed after all retries
    #[error("fetch failed for {model_id} after {attempts} attempts: {message}")]
    FetchFailed {
        /// Model being fetched
        model_id: String,
        /// Attempts made
        attempts: u32,
        /// Last error reported by the fetcher
        message: String,
    },

    /// The entry is referenced by at least one running instance
    #[error("cache entry {model_id} is pinned by {pins} instance(s)")]
    EntryPinned {
        /// Pinned model
        model_id: String,
        /// Current reference count
        pins: u32,
    },

    /// The artifact is still being fetched by another caller
    #[error("cache entry {model_id} is being fetched")]
    FetchInProgress {
        /// Model being fetched
        model_id: String,
    },

    /// No entry for this model
    #[error("cache entry {model_id} not found")]
    EntryNotFound {
        /// Requested model
        model_id: String,
    },

    /// The model id cannot name a cache directory
    #[error("invalid model id {model_id:?}: {reason}")]
    InvalidModelId {
        /// Rejected id
        model_id: String,
        /// Which rule it breaks
        reason: String,
    },

    /// The cache index could not be read or written
    #[error("cache index error at {}: {message}", .path.display())]
    Index {
        /// Index file path
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// Filesystem error while managing artifact directories
    #[error("cache io error at {}: {message}", .path.display())]
    Io {
        /// Path being operated on
        path: PathBuf,
        /// Description of what failed
        message: String,
    },
}

impl CacheError {
    /// Create a fetch failure with a single attempt (used by fetchers)
    pub fn fetch(model_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::FetchFailed {
            model_id: model_id.into(),
            attempts: 1,
            message: msg.into(),
        }
    }

    /// Create an io error for a path
    pub fn io(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Whether a caller could reasonably retry the operation later
    ///
    /// `FetchFailed` has already been retried with backoff by the cache
    /// manager, but a later attempt may still succeed. `EntryPinned` and
    /// capacity errors need operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::FetchFailed { .. } | Self::FetchInProgress { .. })
    }
}

/// Instance lifecycle failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaunchError {
    /// Another instance already owns the port
    #[error("port {port} is already owned by instance {holder}")]
    PortConflict {
        /// Requested port
        port: u16,
        /// Instance currently holding the port
        holder: String,
    },

    /// The health endpoint never answered within the polling budget
    #[error("instance {instance_id} ({model_id}) failed health checks after {attempts} attempts")]
    HealthCheckTimeout {
        /// Instance that failed
        instance_id: String,
        /// Model it was serving
        model_id: String,
        /// Health probes made
        attempts: u32,
    },

    /// The external process exited with a non-zero code
    #[error("instance {instance_id} ({model_id}) exited with code {exit_code}")]
    ExternalProcessExit {
        /// Instance that exited
        instance_id: String,
        /// Model it was serving
        model_id: String,
        /// Exit code reported by the runtime
        exit_code: i32,
    },

    /// No instance with this id
    #[error("instance {instance_id} not found")]
    InstanceNotFound {
        /// Requested instance
        instance_id: String,
    },

    /// The requested action is not valid in the current lifecycle state
    #[error("cannot {action} instance {instance_id} in state {state}")]
    InvalidTransition {
        /// Instance being operated on
        instance_id: String,
        /// Current lifecycle state
        state: String,
        /// Attempted action
        action: String,
    },

    /// The launch was cancelled by a stop before it became ready
    #[error("launch of instance {instance_id} was cancelled")]
    Cancelled {
        /// Instance that was stopped while starting
        instance_id: String,
    },

    /// The runtime backend reported an error
    #[error("runtime error [{runtime}] for {instance_id}: {message}")]
    Runtime {
        /// Runtime kind (local-process, container, kubernetes-pod)
        runtime: String,
        /// Instance being operated on
        instance_id: String,
        /// Description of what failed
        message: String,
    },
}

impl LaunchError {
    /// Create a runtime error
    pub fn runtime(
        runtime: impl Into<String>,
        instance_id: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Runtime {
            runtime: runtime.into(),
            instance_id: instance_id.into(),
            message: msg.into(),
        }
    }

    /// The orchestrator never relaunches automatically
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Recipe catalog rejected at load time
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog directory or a recipe file could not be read
    #[error("failed to read {}: {message}", .path.display())]
    Read {
        /// File or directory path
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// A recipe document is not valid YAML or has the wrong shape
    #[error("failed to parse recipe {recipe_id} in {}: {message}", .path.display())]
    Parse {
        /// Recipe id if it could be read, otherwise the file name
        recipe_id: String,
        /// Source file
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// A recipe parsed but violates a catalog invariant
    #[error("invalid recipe {recipe_id} in {}: {message}", .path.display())]
    Invalid {
        /// Offending recipe
        recipe_id: String,
        /// Source file
        path: PathBuf,
        /// Description of what's invalid
        message: String,
    },

    /// Two documents declare the same recipe id and backend
    #[error("duplicate recipe {recipe_id} ({backend}) in {}", .path.display())]
    Duplicate {
        /// Duplicated recipe id
        recipe_id: String,
        /// Backend of the duplicate
        backend: String,
        /// File containing the second declaration
        path: PathBuf,
    },
}

/// Main error type for engine operations
#[derive(Debug, Error)]
pub enum Error {
    /// Recipe selection failed
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Artifact cache failed
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Instance lifecycle failed
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Recipe catalog failed to load
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Engine configuration is invalid or unreadable
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
    },

    /// Caller input failed validation before reaching a component
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Whether the failed operation may succeed if repeated later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Resolution(e) => e.is_retryable(),
            Self::Cache(e) => e.is_retryable(),
            Self::Launch(e) => e.is_retryable(),
            Self::Catalog(_) | Self::Config { .. } | Self::Validation { .. } => false,
        }
    }
}
