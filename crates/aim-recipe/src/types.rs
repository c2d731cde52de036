//! Strongly-typed recipe records.
//!
//! Everything here is produced by the catalog loader after validation and is
//! immutable afterwards.

use std::collections::BTreeMap;
use std::path::PathBuf;

use aim_common::Error;
use serde::{Deserialize, Serialize};

// =============================================================================
// Precision
// =============================================================================

/// Numeric precision a recipe was validated with
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// IEEE half precision
    Fp16,
    /// bfloat16
    Bf16,
    /// 8-bit floating point
    Fp8,
    /// 8-bit integer quantisation
    Int8,
    /// 4-bit integer quantisation
    Int4,
}

impl Precision {
    /// All precisions in catalog order
    pub const ALL: [Precision; 5] = [
        Self::Fp16,
        Self::Bf16,
        Self::Fp8,
        Self::Int8,
        Self::Int4,
    ];

    /// Returns true for the 16-bit formats preferred when memory allows
    pub fn is_high_precision(&self) -> bool {
        matches!(self, Self::Fp16 | Self::Bf16)
    }

    /// Environment flag the serving image reads for this precision, if any
    pub fn env_flag(&self) -> Option<&'static str> {
        match self {
            Self::Bf16 => Some("VLLM_USE_BF16"),
            Self::Fp16 => Some("VLLM_USE_FP16"),
            Self::Fp8 => Some("VLLM_USE_FP8"),
            Self::Int8 | Self::Int4 => None,
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fp16" | "float16" => Ok(Self::Fp16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            "fp8" => Ok(Self::Fp8),
            "int8" => Ok(Self::Int8),
            "int4" => Ok(Self::Int4),
            _ => Err(Error::validation(format!(
                "invalid precision: {s}, expected one of: fp16, bf16, fp8, int8, int4"
            ))),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fp16 => write!(f, "fp16"),
            Self::Bf16 => write!(f, "bf16"),
            Self::Fp8 => write!(f, "fp8"),
            Self::Int8 => write!(f, "int8"),
            Self::Int4 => write!(f, "int4"),
        }
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Inference server a recipe targets
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// vLLM OpenAI-compatible server
    Vllm,
    /// SGLang server
    Sglang,
}

impl Backend {
    /// All supported backends
    pub const ALL: [Backend; 2] = [Self::Vllm, Self::Sglang];

    /// Name of the recipe document section holding this backend's matrix
    pub fn section_key(&self) -> &'static str {
        match self {
            Self::Vllm => "vllm_serve",
            Self::Sglang => "sglang_serve",
        }
    }

    /// Backend for a `<backend>_serve` section key
    pub fn from_section_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.section_key() == key)
    }

    /// Server entrypoint, before recipe arguments
    pub fn command(&self) -> Vec<String> {
        let module = match self {
            Self::Vllm => "vllm.entrypoints.openai.api_server",
            Self::Sglang => "sglang.launch_server",
        };
        vec!["python".to_string(), "-m".to_string(), module.to_string()]
    }

    /// Argument groups every launch config must carry; each group is
    /// satisfied by any one of its names.
    pub fn required_args(&self) -> &'static [&'static [&'static str]] {
        match self {
            Self::Vllm => &[&["model"], &["dtype"], &["port"]],
            Self::Sglang => &[&["model-path", "model"], &["dtype"], &["port"]],
        }
    }

    /// Backend-specific environment defaults
    pub fn env_defaults(&self) -> [(&'static str, &'static str); 1] {
        match self {
            Self::Vllm => [("VLLM_DISABLE_CUSTOM_ALLREDUCE", "1")],
            Self::Sglang => [("SGLANG_DISABLE_CUSTOM_ALLREDUCE", "1")],
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vllm" => Ok(Self::Vllm),
            "sglang" => Ok(Self::Sglang),
            _ => Err(Error::validation(format!(
                "invalid backend: {s}, expected one of: vllm, sglang"
            ))),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vllm => write!(f, "vllm"),
            Self::Sglang => write!(f, "sglang"),
        }
    }
}

// =============================================================================
// Hardware target
// =============================================================================

/// Accelerator architecture a recipe was validated on
#[derive(Clone, Debug, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(into = "String")]
pub enum HardwareTarget {
    /// A specific architecture tag, normalised to uppercase (e.g. `MI300X`)
    Exact(String),
    /// Validated on any architecture
    Any,
}

impl HardwareTarget {
    /// Parse a catalog hardware tag; `*` and `any` mean wildcard
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        if tag.is_empty() {
            return None;
        }
        if tag == "*" || tag.eq_ignore_ascii_case("any") {
            return Some(Self::Any);
        }
        Some(Self::Exact(normalize_arch(tag)))
    }

    /// Returns true for the wildcard target
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Whether a recipe with this target may run on `arch`
    pub fn accepts(&self, arch: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(tag) => *tag == normalize_arch(arch),
        }
    }
}

impl std::fmt::Display for HardwareTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(tag) => write!(f, "{tag}"),
            Self::Any => write!(f, "*"),
        }
    }
}

impl From<HardwareTarget> for String {
    fn from(target: HardwareTarget) -> Self {
        target.to_string()
    }
}

/// Canonical form of an architecture tag
pub fn normalize_arch(tag: &str) -> String {
    tag.trim().to_uppercase()
}

// =============================================================================
// Launch configuration
// =============================================================================

/// Value of one server argument
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ArgValue {
    /// Bare switch such as `--trust-remote-code`
    Flag,
    /// `--name value`
    Value(String),
}

/// One server argument; `name` is stored without leading dashes
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct LaunchArg {
    /// Argument name without dashes (`tensor-parallel-size`)
    pub name: String,
    /// Argument value
    pub value: ArgValue,
}

/// Kubernetes-style resource requests and limits
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct Resources {
    /// Resource requests (`memory: 64Gi`)
    pub requests: BTreeMap<String, String>,
    /// Resource limits (`amd.com/gpu: "4"`)
    pub limits: BTreeMap<String, String>,
}

/// The concrete argument and resource set for one GPU count
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Number of GPUs this entry was validated with
    pub gpu_count: u32,
    /// Disabled entries are never selected
    pub enabled: bool,
    /// Server arguments in catalog order
    pub args: Vec<LaunchArg>,
    /// Extra environment for the server process
    pub env: BTreeMap<String, String>,
    /// Resource requests and limits
    pub resources: Resources,
}

impl LaunchConfig {
    /// Look up an argument by name, with or without leading dashes
    pub fn arg(&self, name: &str) -> Option<&LaunchArg> {
        let name = name.trim_start_matches('-');
        self.args.iter().find(|a| a.name == name)
    }

    /// String value of an argument, if present and not a bare flag
    pub fn arg_value(&self, name: &str) -> Option<&str> {
        match self.arg(name).map(|a| &a.value) {
            Some(ArgValue::Value(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Render arguments for the command line, substituting `port`
    pub fn render_args(&self, port: u16) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len() * 2);
        for arg in &self.args {
            out.push(format!("--{}", arg.name));
            match &arg.value {
                ArgValue::Flag => {}
                ArgValue::Value(_) if arg.name == "port" => out.push(port.to_string()),
                ArgValue::Value(v) => out.push(v.clone()),
            }
        }
        out
    }
}

// =============================================================================
// Recipe
// =============================================================================

/// Catalog key: one recipe document yields one recipe per backend section
#[derive(Clone, Debug, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecipeKey {
    /// Recipe id from the document
    pub recipe_id: String,
    /// Backend section
    pub backend: Backend,
}

impl std::fmt::Display for RecipeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.recipe_id, self.backend)
    }
}

/// A validated (model, hardware, precision, backend) binding
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Recipe {
    /// Recipe id, e.g. `qwen3-32b-mi300x-bf16`
    pub recipe_id: String,
    /// Exact model id (`namespace/name`)
    pub model_id: String,
    /// Architecture the recipe was validated on
    pub hardware: HardwareTarget,
    /// Numeric precision
    pub precision: Precision,
    /// Serving backend
    pub backend: Backend,
    /// Per-GPU memory below which a low-precision alternative is preferred
    pub min_gpu_memory_bytes: Option<u64>,
    /// Free-form description
    pub description: Option<String>,
    /// File the recipe was loaded from
    pub source: PathBuf,
    /// GPU count to launch config, ascending
    pub configs: BTreeMap<u32, LaunchConfig>,
}

impl Recipe {
    /// Catalog key of this recipe
    pub fn key(&self) -> RecipeKey {
        RecipeKey {
            recipe_id: self.recipe_id.clone(),
            backend: self.backend,
        }
    }

    /// Enabled GPU counts, ascending
    pub fn enabled_gpu_counts(&self) -> impl Iterator<Item = u32> + '_ {
        self.configs
            .values()
            .filter(|c| c.enabled)
            .map(|c| c.gpu_count)
    }

    /// Launch config for exactly `gpu_count`, only if enabled
    pub fn enabled_config(&self, gpu_count: u32) -> Option<&LaunchConfig> {
        self.configs.get(&gpu_count).filter(|c| c.enabled)
    }
}
