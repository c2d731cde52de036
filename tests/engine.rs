//! Engine facade over the shipped recipe catalog.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aim_cache::{CacheConfig, CacheManager, HubCliConfig, HubCliFetcher};
use aim_common::quantity::gib;
use aim_common::{CacheError, Error, LaunchError};
use aim_engine::{Engine, EngineConfig, EngineParts};
use aim_launcher::{
    HealthProbe, LaunchRequest, LaunchSpec, LifecycleState, OrchestratorConfig, Runtime,
    RuntimeHandle, RuntimeKind,
};
use aim_recipe::{
    Backend, HardwareProfile, Precision, RecipeCatalog, RecipeSelector, SelectionConstraints,
    SelectorConfig, StaticDetector,
};
use async_trait::async_trait;

const QWEN: &str = "Qwen/Qwen3-32B";
const LLAMA: &str = "meta-llama/Llama-3.1-8B-Instruct";

fn recipes_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("recipes")
}

fn config(cache_root: &Path) -> EngineConfig {
    let yaml = format!(
        "recipes_dir: {}\nruntime: local-process\nhardware:\n  accelerator_count: 4\n  architecture: MI300X\n  vendor: amd\ncache:\n  root: {}\n  capacity: 200Gi\n",
        recipes_dir().display(),
        cache_root.display()
    );
    EngineConfig::from_yaml_str(&yaml).unwrap()
}

fn model_source(dir: &Path) -> PathBuf {
    let src = dir.join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("config.json"), br#"{"architectures":["Qwen3ForCausalLM"]}"#).unwrap();
    std::fs::write(src.join("model.safetensors"), vec![0u8; 4096]).unwrap();
    src
}

#[tokio::test]
async fn shipped_recipes_resolve_on_declared_hardware() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::from_config(&config(dir.path())).await.unwrap();

    let resolved = engine
        .select(QWEN, &SelectionConstraints::default(), None)
        .await
        .unwrap();
    assert_eq!(resolved.recipe_id, "qwen3-32b-mi300x-bf16");
    assert_eq!(resolved.gpu_count, 4);
    assert!(resolved.auto_selected.gpu_count);

    // Pinning fp8 moves to the quantised recipe, largest count within 4
    let fp8 = engine
        .select(
            QWEN,
            &SelectionConstraints {
                precision: Some(Precision::Fp8),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(fp8.recipe_id, "qwen3-32b-mi300x-fp8");
    assert_eq!(fp8.gpu_count, 2);
    assert!(!fp8.auto_selected.precision);

    // The wildcard recipe serves any architecture
    let llama = engine
        .select(LLAMA, &SelectionConstraints::default(), Some(HardwareProfile::new(1, Some("H100"))))
        .await
        .unwrap();
    assert_eq!(llama.recipe_id, "llama-3.1-8b-instruct-any-bf16");
    assert_eq!(llama.backend, Backend::Vllm);
}

#[tokio::test]
async fn supported_configurations_skip_disabled_entries() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::from_config(&config(dir.path())).await.unwrap();

    let configs = engine.supported_configurations(QWEN);
    // bf16 vLLM 1/2/4/8, bf16 SGLang 4, fp8 vLLM 1/2 (8 disabled)
    assert_eq!(configs.len(), 7);
    assert!(!configs
        .iter()
        .any(|c| c.recipe_id == "qwen3-32b-mi300x-fp8" && c.gpu_count == 8));
    assert!(engine.supported_configurations("nobody/nothing").is_empty());
}

#[tokio::test]
async fn cache_surface_adds_reports_and_removes() {
    let dir = tempfile::tempdir().unwrap();
    let cache_root = dir.path().join("cache");
    let engine = Engine::from_config(&config(&cache_root)).await.unwrap();

    let stats = engine.cache_stats().await;
    assert_eq!(stats.entry_count, 0);
    assert_eq!(stats.capacity_bytes, gib(200));

    engine
        .cache()
        .add_local(QWEN, &model_source(dir.path()))
        .await
        .unwrap();
    let stats = engine.cache_stats().await;
    assert_eq!(stats.entry_count, 1);
    assert!(stats.total_bytes >= 4096);

    engine.cache_remove(QWEN).await.unwrap();
    assert!(matches!(
        engine.cache_remove(QWEN).await,
        Err(Error::Cache(CacheError::EntryNotFound { .. }))
    ));
}

#[tokio::test]
async fn launch_api_validates_and_reports_unknown_instances() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::from_config(&config(dir.path())).await.unwrap();

    let err = engine
        .launch(LaunchRequest {
            port: Some(0),
            ..LaunchRequest::new(QWEN)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));

    assert!(matches!(
        engine.stop("aim-engine-missing").await,
        Err(Error::Launch(LaunchError::InstanceNotFound { .. }))
    ));
    assert!(engine.list().is_empty());
}

// =============================================================================
// Full launch through the facade with a scripted runtime
// =============================================================================

#[derive(Default)]
struct InstantRuntime;

#[async_trait]
impl Runtime for InstantRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Container
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, LaunchError> {
        Ok(RuntimeHandle {
            id: "c0ffee".to_string(),
            name: spec.name.clone(),
        })
    }

    async fn endpoint(&self, _handle: &RuntimeHandle, port: u16) -> Result<Option<String>, LaunchError> {
        Ok(Some(format!("http://127.0.0.1:{port}")))
    }

    async fn exit_code(&self, _handle: &RuntimeHandle) -> Result<Option<i32>, LaunchError> {
        Ok(None)
    }

    async fn terminate(&self, _handle: &RuntimeHandle) -> Result<(), LaunchError> {
        Ok(())
    }

    async fn kill(&self, _handle: &RuntimeHandle) -> Result<(), LaunchError> {
        Ok(())
    }

    async fn release(&self, _handle: &RuntimeHandle) -> Result<(), LaunchError> {
        Ok(())
    }
}

struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn check(&self, _base_url: &str) -> Result<(), String> {
        Ok(())
    }
}

#[tokio::test]
async fn running_instances_pin_their_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = RecipeCatalog::load_dir(&recipes_dir()).unwrap();
    let cache = CacheManager::open(
        CacheConfig {
            root: dir.path().join("cache"),
            capacity_bytes: gib(200),
            ..CacheConfig::default()
        },
        Arc::new(HubCliFetcher::new(HubCliConfig::default()).unwrap()),
    )
    .await
    .unwrap();
    cache.add_local(QWEN, &model_source(dir.path())).await.unwrap();

    let engine = Engine::from_parts(EngineParts {
        selector: RecipeSelector::new(Arc::new(catalog), SelectorConfig::default()),
        detector: Arc::new(StaticDetector::new(HardwareProfile::new(4, Some("MI300X")))),
        cache,
        runtime: Arc::new(InstantRuntime),
        probe: Arc::new(AlwaysHealthy),
        orchestrator: OrchestratorConfig {
            health_initial_delay: Duration::from_millis(5),
            stop_grace: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        },
    });

    let handle = engine.launch(LaunchRequest::new(QWEN)).await.unwrap();
    assert_eq!(handle.resolved.gpu_count, 4);
    let status = handle.wait_ready().await.unwrap();
    assert_eq!(status.state, LifecycleState::Running);
    assert_eq!(status.external_handle.as_deref(), Some("c0ffee"));
    assert_eq!(engine.list().len(), 1);

    assert!(matches!(
        engine.cache_remove(QWEN).await,
        Err(Error::Cache(CacheError::EntryPinned { pins: 1, .. }))
    ));

    engine.stop(&handle.instance_id).await.unwrap();
    assert_eq!(
        engine.status(&handle.instance_id).unwrap().state,
        LifecycleState::Stopped
    );
    engine.cache_remove(QWEN).await.unwrap();
}
