//! Launch specifications: everything a runtime needs to start a server.
//!
//! A [`LaunchSpec`] is runtime-neutral. The local runtime executes
//! `command` directly; the container and pod runtimes wrap it with an image,
//! device flags, and the cache volume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aim_common::{CONTAINER_CACHE_MOUNT, INSTANCE_NAME_PREFIX};
use aim_recipe::{ArgValue, GpuVendor, ResolvedConfiguration, Resources};
use serde::Serialize;

/// Host directory exposed to the workload
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct VolumeMount {
    /// Path on the host
    pub host_path: PathBuf,
    /// Path inside the workload
    pub container_path: String,
}

/// Runtime-neutral description of one server process
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Container / pod / process name; also the instance id
    pub name: String,
    /// Image for container and pod runtimes
    pub image: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Environment for the server
    pub env: BTreeMap<String, String>,
    /// Volumes to mount (empty for local processes)
    pub volumes: Vec<VolumeMount>,
    /// Serving port
    pub port: u16,
    /// GPUs to expose
    pub gpu_count: u32,
    /// Vendor, for device flags and resource names
    pub vendor: GpuVendor,
    /// Recipe resource requests and limits
    pub resources: Resources,
    /// Model directory as the workload sees it
    pub model_path: String,
}

impl LaunchSpec {
    /// Program to execute
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// Arguments after the program
    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    /// The command as one shell-readable line, for logs and `--dry-run`
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Where the cache lives and how the workload reaches it
#[derive(Clone, Debug)]
pub struct CacheLayout<'a> {
    /// Cache root on the host
    pub root: &'a Path,
    /// Materialized model directory on the host
    pub model_path: &'a Path,
    /// Mount the root at the container cache path instead of using host paths
    pub mounted: bool,
}

impl CacheLayout<'_> {
    fn workload_root(&self) -> String {
        if self.mounted {
            CONTAINER_CACHE_MOUNT.to_string()
        } else {
            self.root.display().to_string()
        }
    }

    fn workload_model_path(&self) -> String {
        if !self.mounted {
            return self.model_path.display().to_string();
        }
        match self.model_path.strip_prefix(self.root) {
            Ok(rel) => format!("{}/{}", CONTAINER_CACHE_MOUNT, rel.display()),
            Err(_) => self.model_path.display().to_string(),
        }
    }
}

/// Base name for a resolved configuration:
/// `aim-engine-<model-slug>-<n>gpu-<precision>-<backend>`
pub fn base_name(resolved: &ResolvedConfiguration) -> String {
    format!(
        "{}-{}-{}gpu-{}-{}",
        INSTANCE_NAME_PREFIX,
        slug(&resolved.model_id),
        resolved.gpu_count,
        resolved.precision,
        resolved.backend
    )
}

/// Lowercase DNS-label-safe form of a model id
pub fn slug(model_id: &str) -> String {
    let mut out = String::with_capacity(model_id.len());
    for c in model_id.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Build the launch spec for a resolved configuration.
///
/// The model argument is pointed at the cached artifact and the model id is
/// kept as the served name, so clients address the model by its id.
pub fn build_launch_spec(
    name: &str,
    image: &str,
    resolved: &ResolvedConfiguration,
    vendor: GpuVendor,
    cache: &CacheLayout<'_>,
    port: u16,
) -> LaunchSpec {
    let config = &resolved.launch_config;
    let model_path = cache.workload_model_path();

    let mut command = resolved.backend.command();
    let mut has_served_name = false;
    for arg in &config.args {
        command.push(format!("--{}", arg.name));
        match (&arg.value, arg.name.as_str()) {
            (ArgValue::Flag, _) => {}
            (ArgValue::Value(_), "port") => command.push(port.to_string()),
            (ArgValue::Value(_), "model" | "model-path") => command.push(model_path.clone()),
            (ArgValue::Value(v), other) => {
                has_served_name |= other == "served-model-name";
                command.push(v.clone());
            }
        }
    }
    if !has_served_name {
        command.push("--served-model-name".to_string());
        command.push(resolved.model_id.clone());
    }

    let mut env = BTreeMap::new();
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    if let Some(flag) = resolved.precision.env_flag() {
        env.insert(flag.to_string(), "1".to_string());
    }
    for (key, value) in resolved.backend.env_defaults() {
        env.insert(key.to_string(), value.to_string());
    }
    let root = cache.workload_root();
    for key in ["HF_HOME", "TRANSFORMERS_CACHE", "HF_DATASETS_CACHE", "VLLM_CACHE_DIR"] {
        env.insert(key.to_string(), root.clone());
    }
    env.insert("HF_HUB_DISABLE_TELEMETRY".to_string(), "1".to_string());
    env.insert(
        "PYTORCH_CUDA_ALLOC_CONF".to_string(),
        "max_split_size_mb:512".to_string(),
    );
    env.insert("MODEL_CACHE_PATH".to_string(), model_path.clone());
    // recipe env wins over defaults
    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }

    let volumes = if cache.mounted {
        vec![VolumeMount {
            host_path: cache.root.to_path_buf(),
            container_path: CONTAINER_CACHE_MOUNT.to_string(),
        }]
    } else {
        Vec::new()
    };

    LaunchSpec {
        name: name.to_string(),
        image: image.to_string(),
        command,
        env,
        volumes,
        port,
        gpu_count: resolved.gpu_count,
        vendor,
        resources: config.resources.clone(),
        model_path,
    }
}
