//! Launch Orchestrator: drives instances from request to Running and back.
//!
//! `launch` does the synchronous part (port reservation, selection, cache
//! pin, process start) and hands health polling to a background task. A
//! launch dropped before it reaches `Starting` leaves nothing behind. Every
//! state change goes through [`Inner::transition`], which only applies edges
//! of the lifecycle state machine, so a racing `stop` and health failure
//! cannot both win.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aim_cache::CacheManager;
use aim_common::fs::write_json_atomic;
use aim_common::metrics::{self, ReadyTimer};
use aim_common::quantity::deserialize_duration;
use aim_common::retry::RetryConfig;
use aim_common::{Error, LaunchError, DEFAULT_SERVING_IMAGE, DEFAULT_SERVING_PORT};
use aim_recipe::{HardwareDetector, RecipeSelector, ResolvedConfiguration, SelectionConstraints};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::{HealthProbe, DEFAULT_HEALTH_PATH};
use crate::instance::{InstanceStatus, LifecycleState};
use crate::runtime::{Runtime, RuntimeHandle};
use crate::spec::{base_name, build_launch_spec, CacheLayout};

/// Poll interval while waiting for a terminated workload to exit
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Kubernetes object names are DNS labels
const MAX_NAME_LEN: usize = 63;

// =============================================================================
// Configuration and requests
// =============================================================================

/// Orchestrator settings
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Health probes before giving up
    pub health_attempts: u32,
    /// Delay before the first probe; doubles per attempt
    #[serde(deserialize_with = "deserialize_duration")]
    pub health_initial_delay: Duration,
    /// Path probed on the server
    pub health_path: String,
    /// Timeout of a single probe
    #[serde(deserialize_with = "deserialize_duration")]
    pub health_timeout: Duration,
    /// How long `stop` waits after a graceful signal before killing
    #[serde(deserialize_with = "deserialize_duration")]
    pub stop_grace: Duration,
    /// Exit-status poll interval for running instances
    #[serde(deserialize_with = "deserialize_duration")]
    pub monitor_interval: Duration,
    /// Serving image for container and pod runtimes
    pub image: String,
    /// Port used when a request does not name one
    pub default_port: u16,
    /// Instance snapshot rewritten on every transition
    pub state_file: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_attempts: 5,
            health_initial_delay: Duration::from_secs(2),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            health_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(5),
            image: DEFAULT_SERVING_IMAGE.to_string(),
            default_port: DEFAULT_SERVING_PORT,
            state_file: None,
        }
    }
}

/// Parameters of one launch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Model to serve
    pub model_id: String,
    /// Optional GPU count, precision, and backend pins
    pub constraints: SelectionConstraints,
    /// Serving port; the configured default when None
    pub port: Option<u16>,
}

impl LaunchRequest {
    /// Request with no constraints on the default port
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Instance slots
// =============================================================================

#[derive(Clone, Debug)]
struct Tracked {
    status: InstanceStatus,
    failure: Option<LaunchError>,
}

struct Slot {
    tracked: watch::Sender<Tracked>,
    cancel: CancellationToken,
    released: AtomicBool,
}

impl Slot {
    fn new(status: InstanceStatus) -> Self {
        let (tracked, _) = watch::channel(Tracked {
            status,
            failure: None,
        });
        Self {
            tracked,
            cancel: CancellationToken::new(),
            released: AtomicBool::new(false),
        }
    }

    fn status(&self) -> InstanceStatus {
        self.tracked.borrow().status.clone()
    }

    fn state(&self) -> LifecycleState {
        self.tracked.borrow().status.state
    }

    fn runtime_handle(&self) -> Option<RuntimeHandle> {
        let tracked = self.tracked.borrow();
        tracked.status.external_handle.as_ref().map(|id| RuntimeHandle {
            id: id.clone(),
            name: tracked.status.instance_id.clone(),
        })
    }
}

/// Caller's view of a launch in progress
pub struct LaunchHandle {
    /// Instance id (also the container / pod name)
    pub instance_id: String,
    /// Base URL of the server, if the runtime knows it yet
    pub endpoint: Option<String>,
    /// What the selector resolved
    pub resolved: ResolvedConfiguration,
    slot: Arc<Slot>,
}

impl std::fmt::Debug for LaunchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchHandle")
            .field("instance_id", &self.instance_id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl LaunchHandle {
    /// Current snapshot
    pub fn status(&self) -> InstanceStatus {
        self.slot.status()
    }

    /// Wait for the health loop to finish.
    ///
    /// Ok once Running; the recorded failure if the instance failed;
    /// `Cancelled` if it was stopped first.
    pub async fn wait_ready(&self) -> Result<InstanceStatus, LaunchError> {
        let mut rx = self.slot.tracked.subscribe();
        let cancelled = || LaunchError::Cancelled {
            instance_id: self.instance_id.clone(),
        };
        let tracked = rx
            .wait_for(|t| {
                !matches!(
                    t.status.state,
                    LifecycleState::Pending | LifecycleState::Starting
                )
            })
            .await
            .map_err(|_| cancelled())?
            .clone();

        match tracked.status.state {
            LifecycleState::Running => Ok(tracked.status),
            LifecycleState::Failed => Err(tracked.failure.unwrap_or_else(|| {
                LaunchError::runtime("orchestrator", &self.instance_id, "instance failed")
            })),
            _ => Err(cancelled()),
        }
    }
}

/// Port reservation released on drop unless kept
struct PortLease<'a> {
    ports: &'a DashMap<u16, String>,
    port: u16,
    holder: String,
    armed: bool,
}

impl<'a> PortLease<'a> {
    fn acquire(ports: &'a DashMap<u16, String>, port: u16, holder: &str) -> Result<Self, LaunchError> {
        match ports.entry(port) {
            Entry::Occupied(e) => Err(LaunchError::PortConflict {
                port,
                holder: e.get().clone(),
            }),
            Entry::Vacant(v) => {
                v.insert(holder.to_string());
                Ok(Self {
                    ports,
                    port,
                    holder: holder.to_string(),
                    armed: true,
                })
            }
        }
    }

    fn rename(&mut self, holder: &str) {
        self.ports.insert(self.port, holder.to_string());
        self.holder = holder.to_string();
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PortLease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.ports.remove_if(&self.port, |_, holder| *holder == self.holder);
        }
    }
}

/// Undoes a launch that has not reached `Starting`: forgets the slot,
/// stops a started workload, and drops the cache pin.
struct LaunchGuard {
    inner: Arc<Inner>,
    instance_id: String,
    model_id: String,
    pinned: bool,
    workload: Option<RuntimeHandle>,
    armed: bool,
}

impl LaunchGuard {
    fn new(inner: Arc<Inner>, instance_id: &str, model_id: &str) -> Self {
        Self {
            inner,
            instance_id: instance_id.to_string(),
            model_id: model_id.to_string(),
            pinned: false,
            workload: None,
            armed: true,
        }
    }

    /// Clean up inline, for launch errors
    async fn abort(mut self) {
        self.armed = false;
        self.inner.discard(&self.instance_id);
        if let Some(handle) = self.workload.take() {
            self.inner.shutdown_workload(&handle).await;
        }
        if self.pinned {
            self.inner.cache.unpin(&self.model_id).await;
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(instance_id = %self.instance_id, "Launch dropped before the workload was starting");
        self.inner.discard(&self.instance_id);

        let workload = self.workload.take();
        if workload.is_none() && !self.pinned {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(instance_id = %self.instance_id, "No runtime to release a dropped launch");
            return;
        };
        let inner = self.inner.clone();
        let model_id = self.model_id.clone();
        let pinned = self.pinned;
        runtime.spawn(async move {
            if let Some(handle) = workload {
                inner.shutdown_workload(&handle).await;
            }
            if pinned {
                inner.cache.unpin(&model_id).await;
            }
        });
    }
}

enum Health {
    Ready(String),
    Exited(i32),
    TimedOut(u32),
    Cancelled,
}

// =============================================================================
// Orchestrator
// =============================================================================

struct Inner {
    config: OrchestratorConfig,
    selector: RecipeSelector,
    detector: Arc<dyn HardwareDetector>,
    cache: CacheManager,
    runtime: Arc<dyn Runtime>,
    probe: Arc<dyn HealthProbe>,
    instances: DashMap<String, Arc<Slot>>,
    ports: DashMap<u16, String>,
}

/// Owns every instance record; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Wire the orchestrator to its collaborators
    pub fn new(
        config: OrchestratorConfig,
        selector: RecipeSelector,
        detector: Arc<dyn HardwareDetector>,
        cache: CacheManager,
        runtime: Arc<dyn Runtime>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                selector,
                detector,
                cache,
                runtime,
                probe,
                instances: DashMap::new(),
                ports: DashMap::new(),
            }),
        }
    }

    /// The cache instances are pinned in
    pub fn cache(&self) -> &CacheManager {
        &self.inner.cache
    }

    /// The selector launches resolve through
    pub fn selector(&self) -> &RecipeSelector {
        &self.inner.selector
    }

    /// Start serving a model.
    ///
    /// Returns once the workload has been started (state `Starting`);
    /// health polling continues in the background. Fails fast with
    /// `PortConflict` before any selection, cache, or runtime work if the
    /// port is taken.
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchHandle, Error> {
        let inner = &self.inner;
        let port = request.port.unwrap_or(inner.config.default_port);
        let suffix = short_id();
        let mut lease = PortLease::acquire(&inner.ports, port, &format!("pending-{suffix}"))?;

        let hardware = inner.detector.detect().await;
        let resolved = inner
            .selector
            .select(&request.model_id, &hardware, &request.constraints)?;
        let instance_id = instance_name(&base_name(&resolved), &suffix);
        lease.rename(&instance_id);
        let timer = ReadyTimer::start(resolved.backend.to_string());

        info!(
            instance_id = %instance_id,
            model_id = %resolved.model_id,
            recipe_id = %resolved.recipe_id,
            backend = %resolved.backend,
            gpu_count = resolved.gpu_count,
            port,
            "Launching instance"
        );

        let now = Utc::now();
        let slot = Arc::new(Slot::new(InstanceStatus {
            instance_id: instance_id.clone(),
            model_id: resolved.model_id.clone(),
            recipe_id: resolved.recipe_id.clone(),
            backend: resolved.backend,
            precision: resolved.precision,
            gpu_count: resolved.gpu_count,
            port,
            endpoint: None,
            model_path: inner.cache.model_path(&resolved.model_id),
            state: LifecycleState::Pending,
            runtime: inner.runtime.kind(),
            external_handle: None,
            error: None,
            created_at: now,
            updated_at: now,
        }));
        inner.instances.insert(instance_id.clone(), slot.clone());
        inner.publish();
        let mut guard = LaunchGuard::new(inner.clone(), &instance_id, &resolved.model_id);

        let model_path = match inner.cache.acquire(&resolved.model_id).await {
            Ok(path) => path,
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Model artifact unavailable");
                guard.abort().await;
                return Err(e.into());
            }
        };
        guard.pinned = true;

        let layout = CacheLayout {
            root: inner.cache.root(),
            model_path: &model_path,
            mounted: inner.runtime.kind().mounts_cache(),
        };
        let spec = build_launch_spec(
            &instance_id,
            &inner.config.image,
            &resolved,
            hardware.vendor,
            &layout,
            port,
        );

        let handle = match inner.runtime.start(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Failed to start workload");
                guard.abort().await;
                return Err(e.into());
            }
        };
        guard.workload = Some(handle.clone());
        let endpoint = inner.runtime.endpoint(&handle, port).await.ok().flatten();
        slot.tracked.send_modify(|t| {
            t.status.set_handle(&handle);
            t.status.endpoint = endpoint.clone();
            t.status.model_path = model_path.clone();
        });
        inner.transition(&slot, &[LifecycleState::Pending], LifecycleState::Starting, None);
        guard.disarm();
        lease.keep();

        let task_inner = inner.clone();
        let task_slot = slot.clone();
        tokio::spawn(async move { task_inner.supervise(task_slot, handle, timer).await });

        Ok(LaunchHandle {
            instance_id,
            endpoint,
            resolved,
            slot,
        })
    }

    /// Stop an instance.
    ///
    /// Stopping an already-stopped instance succeeds without side effects;
    /// a concurrent stop waits for the first one to finish.
    pub async fn stop(&self, instance_id: &str) -> Result<(), LaunchError> {
        let inner = &self.inner;
        let slot = inner.slot(instance_id)?;
        let mut rx = slot.tracked.subscribe();

        let from = loop {
            let state = slot.state();
            match state {
                LifecycleState::Stopped => return Ok(()),
                LifecycleState::Pending => {
                    return Err(LaunchError::InvalidTransition {
                        instance_id: instance_id.to_string(),
                        state: state.to_string(),
                        action: "stop".to_string(),
                    })
                }
                LifecycleState::Stopping => {
                    let _ = rx
                        .wait_for(|t| t.status.state != LifecycleState::Stopping)
                        .await;
                }
                LifecycleState::Starting | LifecycleState::Running | LifecycleState::Failed => {
                    if inner.transition(&slot, &[state], LifecycleState::Stopping, None) {
                        break state;
                    }
                }
            }
        };

        slot.cancel.cancel();
        // A failed instance was torn down when it failed.
        if from != LifecycleState::Failed {
            if let Some(handle) = slot.runtime_handle() {
                inner.shutdown_workload(&handle).await;
            }
        }
        inner.release_resources(&slot).await;
        inner.transition(&slot, &[LifecycleState::Stopping], LifecycleState::Stopped, None);
        Ok(())
    }

    /// Stop every instance that is still holding resources
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .inner
            .instances
            .iter()
            .filter(|e| {
                matches!(
                    e.value().state(),
                    LifecycleState::Starting | LifecycleState::Running | LifecycleState::Failed
                )
            })
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(instance_id = %id, error = %e, "Failed to stop instance");
            }
        }
    }

    /// Snapshot of one instance
    pub fn status(&self, instance_id: &str) -> Result<InstanceStatus, LaunchError> {
        self.inner.slot(instance_id).map(|slot| slot.status())
    }

    /// Every known instance, oldest first
    pub fn list(&self) -> Vec<InstanceStatus> {
        self.inner.snapshot()
    }
}

impl Inner {
    fn slot(&self, instance_id: &str) -> Result<Arc<Slot>, LaunchError> {
        self.instances
            .get(instance_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| LaunchError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    fn snapshot(&self) -> Vec<InstanceStatus> {
        let mut all: Vec<InstanceStatus> = self.instances.iter().map(|e| e.value().status()).collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        all
    }

    /// Apply `from → to` if the instance is in one of `from` and the edge
    /// exists. Returns whether the transition happened.
    fn transition(
        &self,
        slot: &Slot,
        from: &[LifecycleState],
        to: LifecycleState,
        failure: Option<LaunchError>,
    ) -> bool {
        let mut previous = None;
        slot.tracked.send_if_modified(|t| {
            let current = t.status.state;
            if !from.contains(&current) || !current.can_transition_to(to) {
                return false;
            }
            previous = Some(current);
            t.status.state = to;
            t.status.updated_at = Utc::now();
            if let Some(failure) = failure {
                t.status.error = Some(failure.to_string());
                t.failure = Some(failure);
            }
            true
        });

        let Some(previous) = previous else {
            return false;
        };
        let instance_id = slot.tracked.borrow().status.instance_id.clone();
        info!(instance_id = %instance_id, from = %previous, to = %to, "Instance state changed");
        metrics::record_transition(previous.as_str(), to.as_str());
        self.publish();
        true
    }

    fn discard(&self, instance_id: &str) {
        self.instances.remove(instance_id);
        self.publish();
    }

    fn publish(&self) {
        let all = self.snapshot();
        metrics::record_instance_counts(LifecycleState::ALL.into_iter().map(|state| {
            (
                state.as_str(),
                all.iter().filter(|s| s.state == state).count() as u64,
            )
        }));
        if let Some(path) = &self.config.state_file {
            if let Err(e) = write_json_atomic(path, &all) {
                warn!(path = %path.display(), error = %e, "Failed to persist instance state");
            }
        }
    }

    /// Unpin the artifact and free the port, once per instance
    async fn release_resources(&self, slot: &Slot) {
        if slot.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let status = slot.status();
        self.cache.unpin(&status.model_id).await;
        self.ports
            .remove_if(&status.port, |_, holder| *holder == status.instance_id);
        debug!(instance_id = %status.instance_id, port = status.port, "Released instance resources");
    }

    /// Terminate, wait up to the grace period, kill, then release
    async fn shutdown_workload(&self, handle: &RuntimeHandle) {
        if let Err(e) = self.runtime.terminate(handle).await {
            warn!(instance_id = %handle.name, error = %e, "Graceful terminate failed");
        }

        let deadline = Instant::now() + self.config.stop_grace;
        loop {
            match self.runtime.exit_code(handle).await {
                Ok(Some(code)) => {
                    debug!(instance_id = %handle.name, exit_code = code, "Workload exited");
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(instance_id = %handle.name, error = %e, "Cannot observe workload exit");
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(instance_id = %handle.name, "Grace period expired, killing workload");
                if let Err(e) = self.runtime.kill(handle).await {
                    warn!(instance_id = %handle.name, error = %e, "Kill failed");
                }
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL.min(deadline - now)).await;
        }

        if let Err(e) = self.runtime.release(handle).await {
            warn!(instance_id = %handle.name, error = %e, "Failed to release workload");
        }
    }

    async fn supervise(self: Arc<Self>, slot: Arc<Slot>, handle: RuntimeHandle, timer: ReadyTimer) {
        let (instance_id, model_id) = {
            let t = slot.tracked.borrow();
            (t.status.instance_id.clone(), t.status.model_id.clone())
        };

        match self.await_healthy(&slot, &handle).await {
            Health::Ready(url) => {
                slot.tracked.send_modify(|t| t.status.endpoint = Some(url));
                if self.transition(&slot, &[LifecycleState::Starting], LifecycleState::Running, None) {
                    timer.ready();
                    self.monitor(&slot, &handle).await;
                }
            }
            Health::Exited(exit_code) => {
                let failure = LaunchError::ExternalProcessExit {
                    instance_id,
                    model_id,
                    exit_code,
                };
                error!(error = %failure, "Workload exited before becoming healthy");
                if self.transition(&slot, &[LifecycleState::Starting], LifecycleState::Failed, Some(failure)) {
                    self.teardown(&slot, &handle, false).await;
                }
            }
            Health::TimedOut(attempts) => {
                let failure = LaunchError::HealthCheckTimeout {
                    instance_id,
                    model_id,
                    attempts,
                };
                error!(error = %failure, "Health check deadline passed");
                if self.transition(&slot, &[LifecycleState::Starting], LifecycleState::Failed, Some(failure)) {
                    self.teardown(&slot, &handle, true).await;
                }
            }
            Health::Cancelled => {
                debug!(instance_id = %instance_id, "Health polling cancelled");
            }
        }
    }

    async fn await_healthy(&self, slot: &Slot, handle: &RuntimeHandle) -> Health {
        let retry = RetryConfig::doubling(self.config.health_attempts, self.config.health_initial_delay);
        let mut backoff = retry.backoff();
        let port = slot.tracked.borrow().status.port;

        for attempt in 1..=retry.max_attempts {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = slot.cancel.cancelled() => return Health::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.runtime.exit_code(handle).await {
                Ok(Some(code)) => return Health::Exited(code),
                Ok(None) => {}
                Err(e) => warn!(instance_id = %handle.name, error = %e, "Cannot read workload status"),
            }

            let url = match self.runtime.endpoint(handle, port).await {
                Ok(Some(url)) => url,
                Ok(None) => {
                    metrics::HEALTH_CHECK_FAILURES.add(1, &[]);
                    debug!(instance_id = %handle.name, attempt, "Endpoint not assigned yet");
                    continue;
                }
                Err(e) => {
                    metrics::HEALTH_CHECK_FAILURES.add(1, &[]);
                    warn!(instance_id = %handle.name, attempt, error = %e, "Cannot resolve endpoint");
                    continue;
                }
            };

            match self.probe.check(&url).await {
                Ok(()) => {
                    info!(instance_id = %handle.name, attempt, url = %url, "Health check passed");
                    return Health::Ready(url);
                }
                Err(reason) => {
                    metrics::HEALTH_CHECK_FAILURES.add(1, &[]);
                    debug!(instance_id = %handle.name, attempt, reason = %reason, "Health check failed");
                }
            }
        }
        Health::TimedOut(retry.max_attempts)
    }

    /// Watch a running workload until it exits or the instance is stopped
    async fn monitor(&self, slot: &Slot, handle: &RuntimeHandle) {
        loop {
            tokio::select! {
                _ = slot.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.monitor_interval) => {}
            }

            match self.runtime.exit_code(handle).await {
                Ok(None) => {}
                Ok(Some(0)) => {
                    if self.transition(slot, &[LifecycleState::Running], LifecycleState::Stopping, None) {
                        info!(instance_id = %handle.name, "Workload exited cleanly");
                        self.teardown(slot, handle, false).await;
                        self.transition(slot, &[LifecycleState::Stopping], LifecycleState::Stopped, None);
                    }
                    return;
                }
                Ok(Some(exit_code)) => {
                    let status = slot.status();
                    let failure = LaunchError::ExternalProcessExit {
                        instance_id: status.instance_id,
                        model_id: status.model_id,
                        exit_code,
                    };
                    error!(error = %failure, "Workload crashed");
                    if self.transition(slot, &[LifecycleState::Running], LifecycleState::Failed, Some(failure)) {
                        self.teardown(slot, handle, false).await;
                    }
                    return;
                }
                Err(e) => warn!(instance_id = %handle.name, error = %e, "Cannot read workload status"),
            }
        }
    }

    async fn teardown(&self, slot: &Slot, handle: &RuntimeHandle, stop_workload: bool) {
        if stop_workload {
            self.shutdown_workload(handle).await;
        } else if let Err(e) = self.runtime.release(handle).await {
            warn!(instance_id = %handle.name, error = %e, "Failed to release workload");
        }
        self.release_resources(slot).await;
    }
}

fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// `<base>-<suffix>`, with the base shortened to fit a DNS label
fn instance_name(base: &str, suffix: &str) -> String {
    let room = MAX_NAME_LEN.saturating_sub(suffix.len() + 1);
    let base: String = base.chars().take(room).collect();
    format!("{}-{}", base.trim_end_matches('-'), suffix)
}
