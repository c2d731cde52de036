//! Recipe Selector: deterministic resolution of a model onto one launch config.
//!
//! Pure over the loaded catalog. Candidates are filtered by model, hardware
//! architecture, and caller constraints; each surviving recipe then picks a
//! GPU count; finally the survivors are ranked by
//!
//! 1. architecture match (exact before wildcard),
//! 2. precision (16-bit before quantised, unless the host is short on memory),
//! 3. `(recipe_id, backend)` lexicographically.
//!
//! The last key is unique within a catalog, so the ranking is a total order.

use std::cmp::Ordering;
use std::sync::Arc;

use aim_common::metrics;
use aim_common::ResolutionError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::RecipeCatalog;
use crate::hardware::HardwareProfile;
use crate::types::{Backend, HardwareTarget, LaunchConfig, Precision, Recipe};

/// Selector tuning
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Per-GPU memory threshold applied to recipes that do not declare
    /// `min_gpu_memory_gb`. None means only recipe-declared thresholds count.
    #[serde(
        default,
        deserialize_with = "aim_common::quantity::deserialize_opt_bytes"
    )]
    pub default_min_gpu_memory_bytes: Option<u64>,
}

/// Optional caller overrides; `None` lets the selector choose
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SelectionConstraints {
    /// Exact GPU count
    #[serde(default)]
    pub gpu_count: Option<u32>,
    /// Exact precision
    #[serde(default)]
    pub precision: Option<Precision>,
    /// Exact backend
    #[serde(default)]
    pub backend: Option<Backend>,
}

/// Which fields of a resolution the selector chose on its own
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AutoSelected {
    /// GPU count was not pinned by the caller
    pub gpu_count: bool,
    /// Precision was not pinned by the caller
    pub precision: bool,
    /// Backend was not pinned by the caller
    pub backend: bool,
}

/// Outcome of a successful selection
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ResolvedConfiguration {
    /// Matched recipe id
    pub recipe_id: String,
    /// Requested model id
    pub model_id: String,
    /// Recipe hardware target
    pub hardware: HardwareTarget,
    /// Recipe precision
    pub precision: Precision,
    /// Recipe backend
    pub backend: Backend,
    /// Chosen GPU count
    pub gpu_count: u32,
    /// The launch config for `gpu_count`
    pub launch_config: LaunchConfig,
    /// Provenance of each field
    pub auto_selected: AutoSelected,
}

/// Selector bound to one catalog
#[derive(Clone, Debug)]
pub struct RecipeSelector {
    catalog: Arc<RecipeCatalog>,
    config: SelectorConfig,
}

impl RecipeSelector {
    /// Create a selector over `catalog`
    pub fn new(catalog: Arc<RecipeCatalog>, config: SelectorConfig) -> Self {
        Self { catalog, config }
    }

    /// The catalog this selector reads
    pub fn catalog(&self) -> &RecipeCatalog {
        &self.catalog
    }

    /// Resolve `model_id` on `hardware` under `constraints`.
    pub fn select(
        &self,
        model_id: &str,
        hardware: &HardwareProfile,
        constraints: &SelectionConstraints,
    ) -> Result<ResolvedConfiguration, ResolutionError> {
        let result = select(&self.catalog, &self.config, model_id, hardware, constraints);
        metrics::record_selection(match &result {
            Ok(_) => "selected",
            Err(ResolutionError::InvalidRequest { .. }) => "invalid",
            Err(ResolutionError::ModelNotFound { .. }) => "model_not_found",
            Err(ResolutionError::NoMatchingGpuCount { .. }) => "no_matching_gpu_count",
            Err(ResolutionError::ConstraintConflict { .. }) => "constraint_conflict",
        });
        result
    }
}

struct Candidate<'a> {
    recipe: &'a Recipe,
    gpu_count: u32,
    arch_rank: u8,
    precision_rank: u8,
}

impl Candidate<'_> {
    fn cmp_rank(&self, other: &Self) -> Ordering {
        self.arch_rank
            .cmp(&other.arch_rank)
            .then(self.precision_rank.cmp(&other.precision_rank))
            .then_with(|| self.recipe.recipe_id.cmp(&other.recipe.recipe_id))
            .then(self.recipe.backend.cmp(&other.recipe.backend))
    }
}

/// Free-function form of [`RecipeSelector::select`].
pub fn select(
    catalog: &RecipeCatalog,
    config: &SelectorConfig,
    model_id: &str,
    hardware: &HardwareProfile,
    constraints: &SelectionConstraints,
) -> Result<ResolvedConfiguration, ResolutionError> {
    let model_id = model_id.trim();
    if model_id.is_empty() {
        return Err(ResolutionError::invalid("model id must not be empty"));
    }
    if constraints.gpu_count == Some(0) {
        return Err(ResolutionError::invalid("requested GPU count must be positive"));
    }

    let mut candidates: Vec<&Recipe> = catalog.recipes_for(model_id).collect();
    if candidates.is_empty() {
        return Err(ResolutionError::ModelNotFound {
            model_id: model_id.to_string(),
        });
    }

    let arch = hardware.architecture.as_deref().filter(|a| !a.is_empty());
    if let Some(arch) = arch {
        candidates.retain(|r| r.hardware.accepts(arch));
        if candidates.is_empty() {
            return Err(conflict(model_id, "hardware", arch));
        }
    }
    if let Some(precision) = constraints.precision {
        candidates.retain(|r| r.precision == precision);
        if candidates.is_empty() {
            return Err(conflict(model_id, "precision", &precision.to_string()));
        }
    }
    if let Some(backend) = constraints.backend {
        candidates.retain(|r| r.backend == backend);
        if candidates.is_empty() {
            return Err(conflict(model_id, "backend", &backend.to_string()));
        }
    }

    let considered: Vec<String> = candidates.iter().map(|r| r.key().to_string()).collect();
    let mut ranked: Vec<Candidate<'_>> = candidates
        .into_iter()
        .filter_map(|recipe| {
            let gpu_count = choose_gpu_count(recipe, hardware.accelerator_count, constraints.gpu_count)?;
            Some(Candidate {
                recipe,
                gpu_count,
                arch_rank: arch_rank(recipe),
                precision_rank: precision_rank(recipe, hardware, config),
            })
        })
        .collect();

    ranked.sort_by(|a, b| a.cmp_rank(b));
    let Some(best) = ranked.into_iter().next() else {
        return Err(ResolutionError::NoMatchingGpuCount {
            model_id: model_id.to_string(),
            requested: constraints.gpu_count,
            available: hardware.accelerator_count,
            candidates: considered,
        });
    };

    // choose_gpu_count only returns counts with an enabled entry
    let Some(launch_config) = best.recipe.enabled_config(best.gpu_count) else {
        return Err(ResolutionError::NoMatchingGpuCount {
            model_id: model_id.to_string(),
            requested: constraints.gpu_count,
            available: hardware.accelerator_count,
            candidates: considered,
        });
    };

    debug!(
        model_id,
        considered = considered.len(),
        arch_rank = best.arch_rank,
        precision_rank = best.precision_rank,
        "Ranked recipe candidates"
    );
    info!(
        model_id,
        recipe_id = %best.recipe.recipe_id,
        backend = %best.recipe.backend,
        precision = %best.recipe.precision,
        gpu_count = best.gpu_count,
        "Selected recipe"
    );

    Ok(ResolvedConfiguration {
        recipe_id: best.recipe.recipe_id.clone(),
        model_id: model_id.to_string(),
        hardware: best.recipe.hardware.clone(),
        precision: best.recipe.precision,
        backend: best.recipe.backend,
        gpu_count: best.gpu_count,
        launch_config: launch_config.clone(),
        auto_selected: AutoSelected {
            gpu_count: constraints.gpu_count.is_none(),
            precision: constraints.precision.is_none(),
            backend: constraints.backend.is_none(),
        },
    })
}

fn conflict(model_id: &str, constraint: &str, value: &str) -> ResolutionError {
    ResolutionError::ConstraintConflict {
        model_id: model_id.to_string(),
        constraint: constraint.to_string(),
        value: value.to_string(),
    }
}

/// Pinned counts must exist and be enabled. Otherwise take the largest
/// enabled count that fits the host, or the smallest when the host count
/// is unknown.
fn choose_gpu_count(recipe: &Recipe, available: u32, requested: Option<u32>) -> Option<u32> {
    match requested {
        Some(n) => recipe.enabled_config(n).map(|c| c.gpu_count),
        None if available == 0 => recipe.enabled_gpu_counts().next(),
        None => recipe.enabled_gpu_counts().filter(|&n| n <= available).last(),
    }
}

/// Recipes validated on a concrete architecture rank ahead of wildcards.
/// With a known architecture the filter has already dropped other tags;
/// with an unknown one every tag survives and still beats `*`.
fn arch_rank(recipe: &Recipe) -> u8 {
    match recipe.hardware {
        HardwareTarget::Exact(_) => 0,
        HardwareTarget::Any => 1,
    }
}

/// 16-bit recipes rank first unless the host's per-GPU memory is below the
/// recipe threshold, in which case they fall behind quantised recipes.
/// Unknown memory is treated as sufficient.
fn precision_rank(recipe: &Recipe, hardware: &HardwareProfile, config: &SelectorConfig) -> u8 {
    if !recipe.precision.is_high_precision() {
        return 1;
    }
    let threshold = recipe
        .min_gpu_memory_bytes
        .or(config.default_min_gpu_memory_bytes);
    match (hardware.memory_per_accelerator_bytes, threshold) {
        (Some(have), Some(need)) if have < need => 2,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::parse_recipe_file;
    use std::path::Path;

    const RECIPES: &str = r#"
recipe_id: llama-8b-any-fp16
huggingface_id: meta-llama/Llama-3.1-8B
hardware: "*"
precision: fp16
vllm_serve:
  1_gpu:
    enabled: true
    args: {--model: meta-llama/Llama-3.1-8B, --dtype: float16, --port: 8000}
  2_gpu:
    enabled: true
    args: {--model: meta-llama/Llama-3.1-8B, --dtype: float16, --port: 8000}
---
recipe_id: llama-8b-mi300x-fp16
huggingface_id: meta-llama/Llama-3.1-8B
hardware: MI300X
precision: fp16
vllm_serve:
  1_gpu:
    enabled: true
    args: {--model: meta-llama/Llama-3.1-8B, --dtype: float16, --port: 8000}
"#;

    fn selector() -> RecipeSelector {
        let recipes = parse_recipe_file(RECIPES, Path::new("llama.yaml")).unwrap();
        RecipeSelector::new(
            Arc::new(RecipeCatalog::from_recipes(recipes).unwrap()),
            SelectorConfig::default(),
        )
    }

    #[test]
    fn exact_architecture_beats_wildcard() {
        let resolved = selector()
            .select(
                "meta-llama/Llama-3.1-8B",
                &HardwareProfile::new(1, Some("MI300X")),
                &SelectionConstraints::default(),
            )
            .unwrap();
        assert_eq!(resolved.recipe_id, "llama-8b-mi300x-fp16");
    }

    #[test]
    fn wildcard_serves_other_architectures() {
        let resolved = selector()
            .select(
                "meta-llama/Llama-3.1-8B",
                &HardwareProfile::new(2, Some("H100")),
                &SelectionConstraints::default(),
            )
            .unwrap();
        assert_eq!(resolved.recipe_id, "llama-8b-any-fp16");
        assert_eq!(resolved.gpu_count, 2);
    }

    #[test]
    fn unknown_hardware_prefers_a_concrete_architecture_and_smallest_count() {
        let resolved = selector()
            .select(
                "meta-llama/Llama-3.1-8B",
                &HardwareProfile::unknown(),
                &SelectionConstraints::default(),
            )
            .unwrap();
        assert_eq!(resolved.gpu_count, 1);
        assert_eq!(resolved.recipe_id, "llama-8b-mi300x-fp16");
    }

    #[test]
    fn pinned_count_drops_recipes_without_it() {
        let resolved = selector()
            .select(
                "meta-llama/Llama-3.1-8B",
                &HardwareProfile::new(8, Some("MI300X")),
                &SelectionConstraints {
                    gpu_count: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(resolved.recipe_id, "llama-8b-any-fp16");
        assert!(!resolved.auto_selected.gpu_count);
        assert!(resolved.auto_selected.precision);
    }

    #[test]
    fn empty_model_id_is_invalid() {
        let err = selector()
            .select("  ", &HardwareProfile::unknown(), &SelectionConstraints::default())
            .unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidRequest { .. }));
    }

    #[test]
    fn zero_gpu_constraint_is_invalid() {
        let err = selector()
            .select(
                "meta-llama/Llama-3.1-8B",
                &HardwareProfile::unknown(),
                &SelectionConstraints {
                    gpu_count: Some(0),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidRequest { .. }));
    }

    #[test]
    fn gpu_count_choice() {
        let recipes = parse_recipe_file(RECIPES, Path::new("llama.yaml")).unwrap();
        let any = &recipes[0];
        assert_eq!(choose_gpu_count(any, 0, None), Some(1));
        assert_eq!(choose_gpu_count(any, 1, None), Some(1));
        assert_eq!(choose_gpu_count(any, 8, None), Some(2));
        assert_eq!(choose_gpu_count(any, 8, Some(2)), Some(2));
        assert_eq!(choose_gpu_count(any, 8, Some(4)), None);
    }
}
