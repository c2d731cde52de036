//! Recipe Store: strict loading of recipe documents into an immutable catalog.
//!
//! A recipe file holds one YAML document per recipe. Each `<backend>_serve`
//! section of a document becomes its own [`Recipe`], keyed by
//! `(recipe_id, backend)`. Loading is all-or-nothing: any malformed entry
//! fails the whole catalog with the offending recipe id and file.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use aim_common::quantity::gib;
use aim_common::yaml::parse_yaml_documents;
use aim_common::CatalogError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::types::{
    ArgValue, Backend, HardwareTarget, LaunchArg, LaunchConfig, Precision, Recipe, RecipeKey,
    Resources,
};

// =============================================================================
// On-disk shape
// =============================================================================

#[derive(Deserialize)]
struct RawRecipe {
    recipe_id: String,
    #[serde(alias = "model_id")]
    huggingface_id: String,
    hardware: String,
    precision: String,
    #[serde(default)]
    min_gpu_memory_gb: Option<f64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(flatten)]
    sections: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLaunchConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    args: Map<String, Value>,
    #[serde(default)]
    env: Map<String, Value>,
    #[serde(default)]
    resources: RawResources,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResources {
    #[serde(default)]
    requests: Map<String, Value>,
    #[serde(default)]
    limits: Map<String, Value>,
}

// =============================================================================
// Catalog
// =============================================================================

/// One enabled (recipe, backend, precision, GPU count) combination
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SupportedConfiguration {
    /// Recipe id
    pub recipe_id: String,
    /// Architecture tag or `*`
    pub hardware: String,
    /// Precision
    pub precision: Precision,
    /// Backend
    pub backend: Backend,
    /// GPU count
    pub gpu_count: u32,
}

/// Immutable set of validated recipes
#[derive(Clone, Debug, Default)]
pub struct RecipeCatalog {
    recipes: BTreeMap<RecipeKey, Recipe>,
    version: String,
}

impl RecipeCatalog {
    /// Load every `*.yaml` / `*.yml` file in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, CatalogError> {
        let read_err = |e: std::io::Error| CatalogError::Read {
            path: dir.to_path_buf(),
            message: e.to_string(),
        };

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(read_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
            })
            .collect();
        files.sort();

        let mut recipes = Vec::new();
        for file in &files {
            let contents = std::fs::read_to_string(file).map_err(|e| CatalogError::Read {
                path: file.clone(),
                message: e.to_string(),
            })?;
            recipes.extend(parse_recipe_file(&contents, file)?);
        }

        let catalog = Self::from_recipes(recipes)?;
        info!(
            dir = %dir.display(),
            files = files.len(),
            recipes = catalog.len(),
            version = %catalog.version,
            "Loaded recipe catalog"
        );
        Ok(catalog)
    }

    /// Build a catalog from already-parsed recipes, rejecting duplicate keys.
    pub fn from_recipes(recipes: impl IntoIterator<Item = Recipe>) -> Result<Self, CatalogError> {
        let mut map = BTreeMap::new();
        for recipe in recipes {
            let key = recipe.key();
            if map.contains_key(&key) {
                return Err(CatalogError::Duplicate {
                    recipe_id: key.recipe_id,
                    backend: key.backend.to_string(),
                    path: recipe.source,
                });
            }
            map.insert(key, recipe);
        }

        let version = fingerprint(&map);
        Ok(Self {
            recipes: map,
            version,
        })
    }

    /// Content fingerprint; changes whenever any recipe changes
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Number of recipes (one per backend section)
    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    /// Returns true if no recipes are loaded
    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// All recipes in key order
    pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
        self.recipes.values()
    }

    /// Recipes for exactly `model_id`, in key order
    pub fn recipes_for<'a>(&'a self, model_id: &'a str) -> impl Iterator<Item = &'a Recipe> + 'a {
        self.recipes.values().filter(move |r| r.model_id == model_id)
    }

    /// Look up one recipe
    pub fn get(&self, recipe_id: &str, backend: Backend) -> Option<&Recipe> {
        self.recipes.get(&RecipeKey {
            recipe_id: recipe_id.to_string(),
            backend,
        })
    }

    /// Distinct model ids, sorted
    pub fn models(&self) -> Vec<&str> {
        self.recipes
            .values()
            .map(|r| r.model_id.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every enabled configuration for a model
    pub fn supported_configurations(&self, model_id: &str) -> Vec<SupportedConfiguration> {
        self.recipes_for(model_id)
            .flat_map(|recipe| {
                recipe
                    .enabled_gpu_counts()
                    .map(move |gpu_count| SupportedConfiguration {
                        recipe_id: recipe.recipe_id.clone(),
                        hardware: recipe.hardware.to_string(),
                        precision: recipe.precision,
                        backend: recipe.backend,
                        gpu_count,
                    })
            })
            .collect()
    }
}

fn fingerprint(recipes: &BTreeMap<RecipeKey, Recipe>) -> String {
    let mut hasher = DefaultHasher::new();
    for recipe in recipes.values() {
        // Recipe serialisation cannot fail: every map key is a string.
        serde_json::to_string(recipe)
            .unwrap_or_default()
            .hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

// =============================================================================
// Parsing and validation
// =============================================================================

/// Parse every recipe document in one file.
pub fn parse_recipe_file(contents: &str, path: &Path) -> Result<Vec<Recipe>, CatalogError> {
    let docs = parse_yaml_documents(contents).map_err(|e| CatalogError::Parse {
        recipe_id: file_label(path),
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut recipes = Vec::new();
    for doc in docs.into_iter().filter(|d| !d.is_null()) {
        recipes.extend(parse_recipe_document(doc, path)?);
    }
    Ok(recipes)
}

/// Validate one document into one recipe per backend section.
pub fn parse_recipe_document(doc: Value, path: &Path) -> Result<Vec<Recipe>, CatalogError> {
    let label = doc
        .get("recipe_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| file_label(path));

    let raw: RawRecipe = serde_json::from_value(doc).map_err(|e| CatalogError::Parse {
        recipe_id: label.clone(),
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let recipe_id = raw.recipe_id.trim().to_string();
    let invalid = |message: String| CatalogError::Invalid {
        recipe_id: if recipe_id.is_empty() {
            label.clone()
        } else {
            recipe_id.clone()
        },
        path: path.to_path_buf(),
        message,
    };

    if recipe_id.is_empty() {
        return Err(invalid("recipe_id is empty".to_string()));
    }
    let model_id = raw.huggingface_id.trim().to_string();
    if model_id.is_empty() {
        return Err(invalid("huggingface_id is empty".to_string()));
    }
    let hardware = HardwareTarget::parse(&raw.hardware)
        .ok_or_else(|| invalid("hardware tag is empty".to_string()))?;
    let precision: Precision = raw
        .precision
        .parse()
        .map_err(|e: aim_common::Error| invalid(e.to_string()))?;
    let min_gpu_memory_bytes = match raw.min_gpu_memory_gb {
        None => None,
        Some(gb) if gb.is_finite() && gb > 0.0 => Some((gb * gib(1) as f64).round() as u64),
        Some(gb) => return Err(invalid(format!("min_gpu_memory_gb must be positive, got {gb}"))),
    };

    let mut recipes = Vec::new();
    for (key, section) in raw.sections {
        if !key.ends_with("_serve") {
            debug!(recipe_id = %recipe_id, key = %key, "Ignoring non-serving recipe field");
            continue;
        }
        let backend = Backend::from_section_key(&key)
            .ok_or_else(|| invalid(format!("unsupported backend section {key}")))?;
        let configs = parse_matrix(section, backend).map_err(&invalid)?;

        recipes.push(Recipe {
            recipe_id: recipe_id.clone(),
            model_id: model_id.clone(),
            hardware: hardware.clone(),
            precision,
            backend,
            min_gpu_memory_bytes,
            description: raw.description.clone(),
            source: path.to_path_buf(),
            configs,
        });
    }

    if recipes.is_empty() {
        return Err(invalid(
            "no backend sections (expected vllm_serve or sglang_serve)".to_string(),
        ));
    }
    Ok(recipes)
}

fn parse_matrix(section: Value, backend: Backend) -> Result<BTreeMap<u32, LaunchConfig>, String> {
    let key = backend.section_key();
    let Value::Object(entries) = section else {
        return Err(format!("{key} must be a mapping of GPU counts"));
    };
    if entries.is_empty() {
        return Err(format!("{key} has no GPU entries"));
    }

    let mut configs = BTreeMap::new();
    for (gpu_key, entry) in entries {
        let gpu_count = parse_gpu_key(&gpu_key).map_err(|e| format!("{key}: {e}"))?;
        let raw: RawLaunchConfig =
            serde_json::from_value(entry).map_err(|e| format!("{key}.{gpu_key}: {e}"))?;
        let config = build_config(gpu_count, raw, backend)
            .map_err(|e| format!("{key}.{gpu_key}: {e}"))?;
        if configs.insert(gpu_count, config).is_some() {
            return Err(format!("{key}: GPU count {gpu_count} declared twice"));
        }
    }
    Ok(configs)
}

/// `4_gpu`, `4_gpus`, or `4` → 4; zero and garbage are rejected.
fn parse_gpu_key(key: &str) -> Result<u32, String> {
    let digits = key
        .strip_suffix("_gpus")
        .or_else(|| key.strip_suffix("_gpu"))
        .unwrap_or(key);
    let count: u32 = digits
        .parse()
        .map_err(|_| format!("malformed GPU key {key:?}, expected e.g. 4_gpu"))?;
    if count == 0 {
        return Err(format!("GPU count must be positive in key {key:?}"));
    }
    Ok(count)
}

fn build_config(gpu_count: u32, raw: RawLaunchConfig, backend: Backend) -> Result<LaunchConfig, String> {
    let mut args: Vec<LaunchArg> = Vec::with_capacity(raw.args.len());
    for (name, value) in raw.args {
        let name = name.trim().trim_start_matches('-').to_string();
        if name.is_empty() {
            return Err("empty argument name".to_string());
        }
        if args.iter().any(|a| a.name == name) {
            return Err(format!("argument --{name} given twice"));
        }
        let value = match value {
            Value::Bool(true) => ArgValue::Flag,
            Value::Bool(false) => continue,
            other => ArgValue::Value(
                scalar_string(other).map_err(|e| format!("argument --{name}: {e}"))?,
            ),
        };
        args.push(LaunchArg { name, value });
    }

    let config = LaunchConfig {
        gpu_count,
        enabled: raw.enabled,
        args,
        env: scalar_map(raw.env).map_err(|e| format!("env: {e}"))?,
        resources: Resources {
            requests: scalar_map(raw.resources.requests)
                .map_err(|e| format!("resources.requests: {e}"))?,
            limits: scalar_map(raw.resources.limits)
                .map_err(|e| format!("resources.limits: {e}"))?,
        },
    };

    for group in backend.required_args() {
        if !group.iter().any(|name| config.arg_value(name).is_some()) {
            let names: Vec<String> = group.iter().map(|n| format!("--{n}")).collect();
            return Err(format!(
                "missing required argument {}",
                names.join(" or ")
            ));
        }
    }

    Ok(config)
}

fn scalar_string(value: Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err("value is null".to_string()),
        Value::Array(_) | Value::Object(_) => Err("value must be a scalar".to_string()),
    }
}

fn scalar_map(map: Map<String, Value>) -> Result<BTreeMap<String, String>, String> {
    map.into_iter()
        .map(|(k, v)| scalar_string(v).map(|s| (k.clone(), s)).map_err(|e| format!("{k}: {e}")))
        .collect()
}

fn file_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
