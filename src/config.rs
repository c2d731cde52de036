//! Engine configuration file.
//!
//! One YAML (or JSON) document composing every component's settings. Every
//! section is optional and falls back to the component's defaults. A few
//! environment variables override the file so containers can be configured
//! without mounting one.

use std::path::{Path, PathBuf};

use aim_cache::{CacheConfig, HubCliConfig};
use aim_common::quantity::parse_bytes;
use aim_common::telemetry::TelemetryConfig;
use aim_common::yaml::parse_yaml;
use aim_common::{Error, Result};
use aim_launcher::{DockerConfig, KubernetesConfig, OrchestratorConfig, RuntimeKind};
use aim_recipe::{HardwareProfile, SelectorConfig};
use serde::Deserialize;
use serde_json::Value;

/// Recipes directory override
pub const ENV_CONFIG_DIR: &str = "AIM_CONFIG_DIR";
/// Cache root override
pub const ENV_CACHE_DIR: &str = "AIM_CACHE_DIR";
/// Cache capacity override (`500Gi`, bare bytes)
pub const ENV_CACHE_CAPACITY: &str = "AIM_CACHE_CAPACITY";
/// Runtime kind override
pub const ENV_RUNTIME: &str = "AIM_RUNTIME";
/// Serving image override
pub const ENV_IMAGE: &str = "AIM_IMAGE";

/// Logging and export settings
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Emit JSON log lines
    pub json: bool,
    /// OTLP collector; `OTEL_EXPORTER_OTLP_ENDPOINT` when unset
    pub otlp_endpoint: Option<String>,
}

/// Everything the engine needs to start
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory of recipe YAML files
    pub recipes_dir: PathBuf,
    /// Selector tuning
    pub selector: SelectorConfig,
    /// Declared hardware; detected from the host when absent
    pub hardware: Option<HardwareProfile>,
    /// Artifact cache
    pub cache: CacheConfig,
    /// Hugging Face downloads
    pub hub: HubCliConfig,
    /// Instance lifecycle
    pub orchestrator: OrchestratorConfig,
    /// Where instances run
    pub runtime: RuntimeKind,
    /// Container runtime settings
    pub docker: DockerConfig,
    /// Pod runtime settings
    pub kubernetes: KubernetesConfig,
    /// Logging and export
    pub telemetry: TelemetrySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recipes_dir: PathBuf::from("recipes"),
            selector: SelectorConfig::default(),
            hardware: None,
            cache: CacheConfig::default(),
            hub: HubCliConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            runtime: RuntimeKind::default(),
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a config document; an empty document yields the defaults
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let value = parse_yaml(input).map_err(|e| Error::config(e.to_string()))?;
        if value == Value::Null {
            return Ok(Self::default());
        }
        serde_json::from_value(value).map_err(|e| Error::config(e.to_string()))
    }

    /// Read a config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_yaml_str(&contents)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))
    }

    /// File (or defaults) plus process environment overrides
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `AIM_*` overrides from `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(ENV_CONFIG_DIR) {
            self.recipes_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache.root = PathBuf::from(dir);
        }
        if let Some(capacity) = lookup(ENV_CACHE_CAPACITY) {
            self.cache.capacity_bytes = parse_bytes(&capacity)
                .map_err(|e| Error::config(format!("{ENV_CACHE_CAPACITY}: {e}")))?;
        }
        if let Some(runtime) = lookup(ENV_RUNTIME) {
            self.runtime = runtime.parse()?;
        }
        if let Some(image) = lookup(ENV_IMAGE) {
            self.orchestrator.image = image;
        }
        Ok(())
    }

    /// Telemetry settings, with `--json-logs` taking precedence
    pub fn telemetry_config(&self, json_logs: bool) -> TelemetryConfig {
        let defaults = TelemetryConfig::default();
        TelemetryConfig {
            service_name: defaults.service_name,
            otlp_endpoint: self.telemetry.otlp_endpoint.clone().or(defaults.otlp_endpoint),
            json: json_logs || self.telemetry.json,
        }
    }
}
