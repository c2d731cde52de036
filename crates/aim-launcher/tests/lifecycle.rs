//! Instance lifecycle against a scripted runtime and health probe.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aim_cache::{CacheConfig, CacheManager, Fetcher};
use aim_common::quantity::gib;
use aim_common::{CacheError, Error, LaunchError, ResolutionError};
use aim_launcher::{
    HealthProbe, LaunchRequest, LaunchSpec, LifecycleState, Orchestrator, OrchestratorConfig,
    Runtime, RuntimeHandle, RuntimeKind,
};
use aim_recipe::catalog::parse_recipe_file;
use aim_recipe::{HardwareProfile, RecipeCatalog, RecipeSelector, SelectorConfig, StaticDetector};
use async_trait::async_trait;

const MODEL: &str = "meta-llama/Llama-3.1-8B-Instruct";

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FixedFetcher {
    delay: Duration,
}

#[async_trait]
impl Fetcher for FixedFetcher {
    async fn size_hint(&self, _model_id: &str) -> Result<u64, CacheError> {
        Ok(gib(16))
    }

    async fn fetch(&self, model_id: &str, dest: &Path) -> Result<u64, CacheError> {
        tokio::time::sleep(self.delay).await;
        std::fs::write(dest.join("config.json"), b"{}")
            .map_err(|e| CacheError::fetch(model_id, e.to_string()))?;
        Ok(gib(16))
    }
}

/// Workloads that run until told to exit. Terminate exits them with 143
/// unless `stubborn`, in which case only kill works.
#[derive(Default)]
struct FakeRuntime {
    exits: Mutex<HashMap<String, Option<i32>>>,
    specs: Mutex<Vec<LaunchSpec>>,
    starts: AtomicU32,
    terminates: AtomicU32,
    kills: AtomicU32,
    releases: AtomicU32,
    stubborn: bool,
    fail_start: bool,
}

impl FakeRuntime {
    fn exit(&self, name: &str, code: i32) {
        self.exits.lock().unwrap().insert(name.to_string(), Some(code));
    }

    fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::LocalProcess
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, LaunchError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(LaunchError::runtime("fake", &spec.name, "image pull failed"));
        }
        self.exits.lock().unwrap().insert(spec.name.clone(), None);
        self.specs.lock().unwrap().push(spec.clone());
        Ok(RuntimeHandle {
            id: format!("fake-{}", self.starts.load(Ordering::SeqCst)),
            name: spec.name.clone(),
        })
    }

    async fn endpoint(&self, _handle: &RuntimeHandle, port: u16) -> Result<Option<String>, LaunchError> {
        Ok(Some(format!("http://127.0.0.1:{port}")))
    }

    async fn exit_code(&self, handle: &RuntimeHandle) -> Result<Option<i32>, LaunchError> {
        Ok(self.exits.lock().unwrap().get(&handle.name).copied().flatten())
    }

    async fn terminate(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        if !self.stubborn {
            self.exit(&handle.name, 143);
        }
        Ok(())
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), LaunchError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exit(&handle.name, 137);
        Ok(())
    }

    async fn release(&self, _handle: &RuntimeHandle) -> Result<(), LaunchError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Healthy from the `healthy_after`-th probe on; never when None.
struct FakeProbe {
    healthy_after: Option<u32>,
    probes: AtomicU32,
}

impl FakeProbe {
    fn healthy_after(n: u32) -> Self {
        Self {
            healthy_after: Some(n),
            probes: AtomicU32::new(0),
        }
    }

    fn never() -> Self {
        Self {
            healthy_after: None,
            probes: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn check(&self, base_url: &str) -> Result<(), String> {
        let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
        match self.healthy_after {
            Some(after) if n >= after => Ok(()),
            _ => Err(format!("{base_url}/health returned 503 Service Unavailable")),
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    orchestrator: Orchestrator,
    runtime: Arc<FakeRuntime>,
    _dir: tempfile::TempDir,
}

fn recipes() -> Arc<RecipeCatalog> {
    let doc = format!(
        "recipe_id: llama-3.1-8b-mi300x-bf16\nhuggingface_id: {MODEL}\nhardware: MI300X\nprecision: bf16\nvllm_serve:\n  1_gpu:\n    enabled: true\n    args:\n      --model: {MODEL}\n      --dtype: bfloat16\n      --port: 8000\n"
    );
    let recipes = parse_recipe_file(&doc, Path::new("llama.yaml")).unwrap();
    Arc::new(RecipeCatalog::from_recipes(recipes).unwrap())
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        health_attempts: 3,
        health_initial_delay: Duration::from_millis(5),
        stop_grace: Duration::from_millis(100),
        monitor_interval: Duration::from_millis(5),
        ..OrchestratorConfig::default()
    }
}

async fn harness(runtime: FakeRuntime, probe: FakeProbe, config: OrchestratorConfig) -> Harness {
    harness_with_fetcher(runtime, probe, config, FixedFetcher::default()).await
}

async fn harness_with_fetcher(
    runtime: FakeRuntime,
    probe: FakeProbe,
    config: OrchestratorConfig,
    fetcher: FixedFetcher,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheManager::open(
        CacheConfig {
            root: dir.path().to_path_buf(),
            capacity_bytes: gib(100),
            fetch_attempts: 1,
            fetch_initial_delay: Duration::from_millis(1),
            ..CacheConfig::default()
        },
        Arc::new(fetcher),
    )
    .await
    .unwrap();

    let runtime = Arc::new(runtime);
    let orchestrator = Orchestrator::new(
        config,
        RecipeSelector::new(recipes(), SelectorConfig::default()),
        Arc::new(StaticDetector::new(HardwareProfile::new(1, Some("MI300X")))),
        cache,
        runtime.clone(),
        Arc::new(probe),
    );
    Harness {
        orchestrator,
        runtime,
        _dir: dir,
    }
}

async fn wait_for_state(orchestrator: &Orchestrator, id: &str, state: LifecycleState) {
    for _ in 0..400 {
        if orchestrator.status(id).unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "instance {id} never reached {state}, still {}",
        orchestrator.status(id).unwrap().state
    );
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn launch_becomes_ready_and_stop_releases_everything() {
    let h = harness(FakeRuntime::default(), FakeProbe::healthy_after(2), fast_config()).await;
    let cache = h.orchestrator.cache().clone();

    let handle = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    // Long names are shortened to fit a DNS label
    assert!(handle.instance_id.starts_with("aim-engine-meta-llama-llama-3-1-8b-instruct-1gpu-bf16-"));
    assert!(handle.instance_id.len() <= 63);
    assert_eq!(handle.resolved.gpu_count, 1);

    let status = handle.wait_ready().await.unwrap();
    assert_eq!(status.state, LifecycleState::Running);
    assert_eq!(status.endpoint.as_deref(), Some("http://127.0.0.1:8000"));
    assert_eq!(cache.pins(MODEL).await, 1);

    let spec = h.runtime.specs.lock().unwrap()[0].clone();
    assert!(spec.command.contains(&cache.model_path(MODEL).display().to_string()));

    h.orchestrator.stop(&handle.instance_id).await.unwrap();
    let status = h.orchestrator.status(&handle.instance_id).unwrap();
    assert_eq!(status.state, LifecycleState::Stopped);
    assert_eq!(cache.pins(MODEL).await, 0);
    assert_eq!(FakeRuntime::count(&h.runtime.terminates), 1);
    assert_eq!(FakeRuntime::count(&h.runtime.kills), 0);
    assert_eq!(FakeRuntime::count(&h.runtime.releases), 1);

    // The port is free again
    let again = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    again.wait_ready().await.unwrap();
    h.orchestrator.stop_all().await;
}

#[tokio::test]
async fn second_launch_on_a_held_port_conflicts_without_starting() {
    let h = harness(FakeRuntime::default(), FakeProbe::healthy_after(1), fast_config()).await;

    let first = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    first.wait_ready().await.unwrap();

    let err = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap_err();
    match err {
        Error::Launch(LaunchError::PortConflict { port, holder }) => {
            assert_eq!(port, 8000);
            assert_eq!(holder, first.instance_id);
        }
        other => panic!("expected port conflict, got {other}"),
    }
    assert_eq!(FakeRuntime::count(&h.runtime.starts), 1);
    assert_eq!(h.orchestrator.list().len(), 1);

    // A different port is fine
    let second = h
        .orchestrator
        .launch(LaunchRequest {
            port: Some(8001),
            ..LaunchRequest::new(MODEL)
        })
        .await
        .unwrap();
    second.wait_ready().await.unwrap();
    assert_eq!(h.orchestrator.cache().pins(MODEL).await, 2);
    h.orchestrator.stop_all().await;
    assert_eq!(h.orchestrator.cache().pins(MODEL).await, 0);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = harness(FakeRuntime::default(), FakeProbe::healthy_after(1), fast_config()).await;
    let handle = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    handle.wait_ready().await.unwrap();

    h.orchestrator.stop(&handle.instance_id).await.unwrap();
    h.orchestrator.stop(&handle.instance_id).await.unwrap();

    assert_eq!(FakeRuntime::count(&h.runtime.terminates), 1);
    assert_eq!(FakeRuntime::count(&h.runtime.releases), 1);
    assert_eq!(h.orchestrator.cache().pins(MODEL).await, 0);
}

#[tokio::test]
async fn health_timeout_fails_the_instance_and_frees_resources() {
    let h = harness(FakeRuntime::default(), FakeProbe::never(), fast_config()).await;
    let handle = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();

    let err = handle.wait_ready().await.unwrap_err();
    assert_eq!(
        err,
        LaunchError::HealthCheckTimeout {
            instance_id: handle.instance_id.clone(),
            model_id: MODEL.to_string(),
            attempts: 3,
        }
    );

    let status = h.orchestrator.status(&handle.instance_id).unwrap();
    assert_eq!(status.state, LifecycleState::Failed);
    assert!(status.error.unwrap().contains("3 attempts"));

    // Teardown runs after the transition; give it a moment
    for _ in 0..100 {
        if h.orchestrator.cache().pins(MODEL).await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.orchestrator.cache().pins(MODEL).await, 0);
    assert_eq!(FakeRuntime::count(&h.runtime.terminates), 1);

    // Stopping a failed instance cleans up nothing twice
    h.orchestrator.stop(&handle.instance_id).await.unwrap();
    assert_eq!(
        h.orchestrator.status(&handle.instance_id).unwrap().state,
        LifecycleState::Stopped
    );
    assert_eq!(FakeRuntime::count(&h.runtime.terminates), 1);

    // The port was released
    h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
}

#[tokio::test]
async fn stop_while_starting_cancels_the_launch() {
    let config = OrchestratorConfig {
        health_initial_delay: Duration::from_secs(30),
        ..fast_config()
    };
    let h = harness(FakeRuntime::default(), FakeProbe::healthy_after(1), config).await;
    let handle = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    assert_eq!(handle.status().state, LifecycleState::Starting);

    h.orchestrator.stop(&handle.instance_id).await.unwrap();

    assert_eq!(
        handle.wait_ready().await.unwrap_err(),
        LaunchError::Cancelled {
            instance_id: handle.instance_id.clone()
        }
    );
    assert_eq!(handle.status().state, LifecycleState::Stopped);
    assert_eq!(h.orchestrator.cache().pins(MODEL).await, 0);
}

#[tokio::test]
async fn stubborn_workloads_are_killed_after_the_grace_period() {
    let runtime = FakeRuntime {
        stubborn: true,
        ..FakeRuntime::default()
    };
    let h = harness(runtime, FakeProbe::healthy_after(1), fast_config()).await;
    let handle = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    handle.wait_ready().await.unwrap();

    h.orchestrator.stop(&handle.instance_id).await.unwrap();
    assert_eq!(FakeRuntime::count(&h.runtime.terminates), 1);
    assert_eq!(FakeRuntime::count(&h.runtime.kills), 1);
    assert_eq!(handle.status().state, LifecycleState::Stopped);
}

#[tokio::test]
async fn exit_before_ready_is_reported_with_its_code() {
    let h = harness(FakeRuntime::default(), FakeProbe::never(), fast_config()).await;
    let handle = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    h.runtime.exit(&handle.instance_id, 1);

    assert_eq!(
        handle.wait_ready().await.unwrap_err(),
        LaunchError::ExternalProcessExit {
            instance_id: handle.instance_id.clone(),
            model_id: MODEL.to_string(),
            exit_code: 1,
        }
    );
}

#[tokio::test]
async fn crash_while_running_fails_and_clean_exit_stops() {
    let h = harness(FakeRuntime::default(), FakeProbe::healthy_after(1), fast_config()).await;

    let crashed = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    crashed.wait_ready().await.unwrap();
    h.runtime.exit(&crashed.instance_id, 139);
    wait_for_state(&h.orchestrator, &crashed.instance_id, LifecycleState::Failed).await;
    let status = crashed.status();
    assert!(status.error.unwrap().contains("exited with code 139"));

    let clean = h
        .orchestrator
        .launch(LaunchRequest {
            port: Some(8001),
            ..LaunchRequest::new(MODEL)
        })
        .await
        .unwrap();
    clean.wait_ready().await.unwrap();
    h.runtime.exit(&clean.instance_id, 0);
    wait_for_state(&h.orchestrator, &clean.instance_id, LifecycleState::Stopped).await;

    for _ in 0..100 {
        if h.orchestrator.cache().pins(MODEL).await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.orchestrator.cache().pins(MODEL).await, 0);
}

#[tokio::test]
async fn failed_selection_holds_nothing() {
    let h = harness(FakeRuntime::default(), FakeProbe::healthy_after(1), fast_config()).await;

    let err = h
        .orchestrator
        .launch(LaunchRequest::new("unknown/model"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Resolution(ResolutionError::ModelNotFound { .. })
    ));
    assert!(h.orchestrator.list().is_empty());
    assert_eq!(FakeRuntime::count(&h.runtime.starts), 0);

    let handle = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    handle.wait_ready().await.unwrap();
    h.orchestrator.stop_all().await;
}

#[tokio::test]
async fn failed_start_unpins_and_forgets_the_instance() {
    let runtime = FakeRuntime {
        fail_start: true,
        ..FakeRuntime::default()
    };
    let h = harness(runtime, FakeProbe::healthy_after(1), fast_config()).await;

    let err = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap_err();
    assert!(matches!(err, Error::Launch(LaunchError::Runtime { .. })));
    assert!(h.orchestrator.list().is_empty());
    assert_eq!(h.orchestrator.cache().pins(MODEL).await, 0);
}

#[tokio::test]
async fn unknown_instances_are_reported() {
    let h = harness(FakeRuntime::default(), FakeProbe::never(), fast_config()).await;
    assert_eq!(
        h.orchestrator.stop("aim-engine-nope").await.unwrap_err(),
        LaunchError::InstanceNotFound {
            instance_id: "aim-engine-nope".to_string()
        }
    );
    assert!(h.orchestrator.status("aim-engine-nope").is_err());
}

#[tokio::test]
async fn state_file_tracks_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("instances.json");
    let config = OrchestratorConfig {
        state_file: Some(state_file.clone()),
        ..fast_config()
    };
    let h = harness(FakeRuntime::default(), FakeProbe::healthy_after(1), config).await;
    let handle = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    handle.wait_ready().await.unwrap();
    h.orchestrator.stop(&handle.instance_id).await.unwrap();

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_file).unwrap()).unwrap();
    assert_eq!(saved[0]["instance_id"], handle.instance_id.as_str());
    assert_eq!(saved[0]["state"], "stopped");
}

#[tokio::test]
async fn dropped_launch_leaves_no_instance_or_pin() {
    let h = harness_with_fetcher(
        FakeRuntime::default(),
        FakeProbe::healthy_after(1),
        fast_config(),
        FixedFetcher {
            delay: Duration::from_millis(150),
        },
    )
    .await;
    let cache = h.orchestrator.cache().clone();

    let dropped = tokio::time::timeout(
        Duration::from_millis(30),
        h.orchestrator.launch(LaunchRequest::new(MODEL)),
    )
    .await;
    assert!(dropped.is_err());
    assert!(h.orchestrator.list().is_empty());

    // the detached fetch completes without pinning
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cache.pins(MODEL).await, 0);
    assert_eq!(FakeRuntime::count(&h.runtime.starts), 0);

    // the port is free again and the artifact is a cache hit
    let handle = h.orchestrator.launch(LaunchRequest::new(MODEL)).await.unwrap();
    handle.wait_ready().await.unwrap();
    h.orchestrator.stop(&handle.instance_id).await.unwrap();
    cache.remove(MODEL).await.unwrap();
}
