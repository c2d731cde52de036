//! Recipe catalog, hardware detection, and recipe selection.
//!
//! A recipe binds a model, an accelerator architecture, a precision, and a
//! serving backend to a matrix of GPU count → launch arguments. The
//! [`RecipeSelector`] picks exactly one entry for a launch request.

#![deny(missing_docs)]

pub mod catalog;
pub mod hardware;
pub mod selector;
pub mod types;

pub use catalog::{RecipeCatalog, SupportedConfiguration};
pub use hardware::{
    GpuVendor, HardwareDetector, HardwareProfile, StaticDetector, SystemDetector,
};
pub use selector::{
    AutoSelected, RecipeSelector, ResolvedConfiguration, SelectionConstraints, SelectorConfig,
};
pub use types::{
    ArgValue, Backend, HardwareTarget, LaunchArg, LaunchConfig, Precision, Recipe, RecipeKey,
    Resources,
};
