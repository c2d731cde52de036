//! Common types for the AIM engine: errors, retry, telemetry, and persistence helpers

#![deny(missing_docs)]

pub mod error;
pub mod fs;
pub mod metrics;
pub mod process;
pub mod quantity;
pub mod retry;
pub mod telemetry;
pub mod yaml;

pub use error::{CacheError, CatalogError, Error, LaunchError, ResolutionError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port the inference server listens on
pub const DEFAULT_SERVING_PORT: u16 = 8000;

/// Mount point of the model cache inside serving containers
pub const CONTAINER_CACHE_MOUNT: &str = "/workspace/model-cache";

/// Default container image for ROCm hosts
pub const DEFAULT_SERVING_IMAGE: &str = "rocm/vllm:latest";

/// Label / name prefix applied to everything the engine launches
pub const INSTANCE_NAME_PREFIX: &str = "aim-engine";
