//! AIM engine - recipe-driven deployment of large language models on GPU hosts
//!
//! Given a model id, the engine picks a validated recipe for the hardware at
//! hand, makes sure the model artifact is in the local cache, launches the
//! inference server, and tracks it until it is stopped.
//!
//! # Crates
//!
//! - [`aim_recipe`] - recipe catalog, hardware detection, recipe selection
//! - [`aim_cache`] - capacity-bounded model artifact cache
//! - [`aim_launcher`] - instance lifecycle over processes, containers, and pods
//! - [`aim_common`] - errors, retry, telemetry, and persistence helpers
//!
//! # Modules
//!
//! - [`config`] - engine configuration file and environment overrides
//! - [`engine`] - the [`Engine`] facade
//! - [`cli`] - the `aim` command line

#![deny(missing_docs)]

pub mod cli;
pub mod config;
pub mod engine;

pub use aim_common::{Error, Result};
pub use config::EngineConfig;
pub use engine::{Engine, EngineParts};
