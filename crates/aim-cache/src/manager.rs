//! Cache Manager: capacity-bounded store of model artifacts.
//!
//! All mutations go through one async mutex per cache root. The
//! check-evict-reserve sequence runs under the lock and is persisted before
//! the lock is released; the fetch itself runs outside the lock against the
//! reserved slot, in a detached task so a cancelled caller cannot strand a
//! reservation. Pins are only taken in the caller's own future, so a
//! cancelled caller cannot leave one behind either.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aim_common::metrics;
use aim_common::quantity::{deserialize_bytes, deserialize_duration, deserialize_opt_duration, format_gib, gib};
use aim_common::retry::{retry_with_backoff_if, RetryConfig};
use aim_common::CacheError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::entry::{model_dir_name, validate_model_id, CacheEntry, EntryState, Priority};
use crate::fetcher::{Fetcher, LocalCopyFetcher};
use crate::index::{CacheIndex, INDEX_FILE};

// =============================================================================
// Configuration
// =============================================================================

/// Per-model cache policy
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ModelPolicy {
    /// Model id the policy applies to
    pub id: String,
    /// Eviction priority
    #[serde(default)]
    pub priority: Priority,
    /// Sliding retention window; None keeps the entry until evicted
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub retention: Option<Duration>,
}

/// Cache Manager configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; artifacts live under `<root>/models/`
    pub root: PathBuf,
    /// Maximum bytes across all entries
    #[serde(alias = "capacity", deserialize_with = "deserialize_bytes")]
    pub capacity_bytes: u64,
    /// Priority for models without a policy
    pub default_priority: Priority,
    /// Retention for models without a policy
    #[serde(deserialize_with = "deserialize_opt_duration")]
    pub default_retention: Option<Duration>,
    /// Per-model overrides
    pub models: Vec<ModelPolicy>,
    /// Attempts per fetch, including the first
    pub fetch_attempts: u32,
    /// Delay after the first failed fetch; doubles per attempt
    #[serde(deserialize_with = "deserialize_duration")]
    pub fetch_initial_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(aim_common::CONTAINER_CACHE_MOUNT),
            capacity_bytes: gib(500),
            default_priority: Priority::Normal,
            default_retention: Some(Duration::from_secs(30 * 86_400)),
            models: Vec::new(),
            fetch_attempts: 3,
            fetch_initial_delay: Duration::from_secs(2),
        }
    }
}

impl CacheConfig {
    fn policy_for(&self, model_id: &str) -> (Priority, Option<Duration>) {
        self.models
            .iter()
            .find(|p| p.id == model_id)
            .map(|p| (p.priority, p.retention))
            .unwrap_or((self.default_priority, self.default_retention))
    }

    fn fetch_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.fetch_attempts.max(1),
            initial_delay: self.fetch_initial_delay,
            ..RetryConfig::default()
        }
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// One entry plus its live pin count
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct EntrySnapshot {
    /// Persisted entry
    #[serde(flatten)]
    pub entry: CacheEntry,
    /// Instances currently holding the entry
    pub pins: u32,
}

/// Read-only view of the cache
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    /// Cache root
    pub root: PathBuf,
    /// Configured capacity
    pub capacity_bytes: u64,
    /// Bytes held by ready and reserved entries
    pub total_bytes: u64,
    /// Number of entries
    pub entry_count: usize,
    /// Per-entry detail, ordered by model id
    pub entries: Vec<EntrySnapshot>,
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Default)]
struct State {
    index: CacheIndex,
    pins: HashMap<String, u32>,
    inflight: HashMap<String, watch::Receiver<()>>,
}

impl State {
    fn pins(&self, model_id: &str) -> u32 {
        self.pins.get(model_id).copied().unwrap_or(0)
    }

    /// Pin `model_id` if it is ready; returns the new count
    fn pin_ready(&mut self, model_id: &str) -> Option<u32> {
        if !self
            .index
            .entries
            .get(model_id)
            .is_some_and(CacheEntry::is_ready)
        {
            return None;
        }
        let pins = self.pins.entry(model_id.to_string()).or_insert(0);
        *pins += 1;
        Some(*pins)
    }
}

struct Inner {
    config: CacheConfig,
    index_path: PathBuf,
    models_dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    state: Mutex<State>,
}

/// Handle to one cache root; cheap to clone
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("root", &self.inner.config.root)
            .field("capacity_bytes", &self.inner.config.capacity_bytes)
            .finish()
    }
}

impl CacheManager {
    /// Open (or create) the cache at `config.root`.
    ///
    /// Reservations left by an interrupted process are dropped along with
    /// their partial directories, and ready entries whose directory has
    /// vanished are forgotten. If the index holds more than the configured
    /// capacity (the capacity was lowered), entries are evicted in the usual
    /// order until it fits.
    pub async fn open(config: CacheConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self, CacheError> {
        let models_dir = config.root.join("models");
        tokio::fs::create_dir_all(&models_dir)
            .await
            .map_err(|e| CacheError::io(&models_dir, e.to_string()))?;

        let index_path = config.root.join(INDEX_FILE);
        let mut index = CacheIndex::load(&index_path)?;

        let mut dropped = Vec::new();
        for (model_id, entry) in &index.entries {
            if !entry.is_ready() {
                warn!(model_id = %model_id, "Dropping stale reservation");
                remove_dir(&entry.path).await;
                dropped.push(model_id.clone());
            } else if !entry.path.exists() {
                warn!(model_id = %model_id, path = %entry.path.display(), "Cached artifact missing on disk");
                dropped.push(model_id.clone());
            }
        }
        for model_id in &dropped {
            index.entries.remove(model_id);
        }
        if !dropped.is_empty() {
            index.save(&index_path)?;
        }

        let inner = Inner {
            config,
            index_path,
            models_dir,
            fetcher,
            state: Mutex::new(State {
                index,
                ..State::default()
            }),
        };
        {
            let mut state = inner.state.lock().await;
            inner.shrink_to_capacity(&mut state).await?;
            inner.publish(&state.index);
            info!(
                root = %inner.config.root.display(),
                entries = state.index.entries.len(),
                used = %format_gib(state.index.total_bytes()),
                capacity = %format_gib(inner.config.capacity_bytes),
                "Opened model cache"
            );
        }
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    /// Configured capacity in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.inner.config.capacity_bytes
    }

    /// Directory an artifact for `model_id` lives in (whether cached or not)
    pub fn model_path(&self, model_id: &str) -> PathBuf {
        self.inner.models_dir.join(model_dir_name(model_id))
    }

    /// Return the local path of `model_id`, fetching it if absent or expired.
    ///
    /// Every call refreshes the entry's last-access time and retention
    /// deadline.
    pub async fn ensure(&self, model_id: &str) -> Result<PathBuf, CacheError> {
        self.materialize(model_id, self.inner.fetcher.clone(), false)
            .await
    }

    /// [`ensure`](Self::ensure) and pin in one step, so the entry cannot be
    /// evicted between the two.
    pub async fn acquire(&self, model_id: &str) -> Result<PathBuf, CacheError> {
        self.materialize(model_id, self.inner.fetcher.clone(), true)
            .await
    }

    /// Copy a local artifact into the cache, replacing any unpinned entry.
    pub async fn add_local(&self, model_id: &str, source: &Path) -> Result<PathBuf, CacheError> {
        match self.remove(model_id).await {
            Ok(()) | Err(CacheError::EntryNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        let fetcher: Arc<dyn Fetcher> = Arc::new(LocalCopyFetcher::new(source));
        self.materialize(model_id, fetcher, false).await
    }

    /// Add a reference to a ready entry; returns the new pin count
    pub async fn pin(&self, model_id: &str) -> Result<u32, CacheError> {
        let mut state = self.inner.state.lock().await;
        let pins = state
            .pin_ready(model_id)
            .ok_or_else(|| CacheError::EntryNotFound {
                model_id: model_id.to_string(),
            })?;
        debug!(model_id, pins, "Pinned cache entry");
        Ok(pins)
    }

    /// Drop a reference; returns the remaining pin count
    pub async fn unpin(&self, model_id: &str) -> u32 {
        let mut state = self.inner.state.lock().await;
        let remaining = match state.pins.get_mut(model_id) {
            Some(pins) if *pins > 1 => {
                *pins -= 1;
                *pins
            }
            Some(_) => {
                state.pins.remove(model_id);
                0
            }
            None => {
                warn!(model_id, "Unpin of an entry that is not pinned");
                0
            }
        };
        debug!(model_id, pins = remaining, "Unpinned cache entry");
        remaining
    }

    /// Current pin count
    pub async fn pins(&self, model_id: &str) -> u32 {
        self.inner.state.lock().await.pins(model_id)
    }

    /// Evict unpinned entries in priority-then-LRU order until at least
    /// `bytes_to_free` bytes are released or nothing evictable remains.
    /// Returns the evicted model ids.
    pub async fn evict(&self, bytes_to_free: u64) -> Result<Vec<String>, CacheError> {
        let mut state = self.inner.state.lock().await;
        let mut freed = 0u64;
        let mut evicted = Vec::new();
        for model_id in eviction_order(&state, None) {
            if freed >= bytes_to_free {
                break;
            }
            if let Some(entry) = self.inner.evict_entry(&mut state, &model_id, "manual").await {
                freed += entry.size_bytes;
                evicted.push(model_id);
            }
        }
        if !evicted.is_empty() {
            self.inner.persist(&state)?;
        }
        Ok(evicted)
    }

    /// Explicitly remove an entry and its files
    pub async fn remove(&self, model_id: &str) -> Result<(), CacheError> {
        let mut state = self.inner.state.lock().await;
        let pins = state.pins(model_id);
        if pins > 0 {
            return Err(CacheError::EntryPinned {
                model_id: model_id.to_string(),
                pins,
            });
        }
        match state.index.entries.get(model_id) {
            None => {
                return Err(CacheError::EntryNotFound {
                    model_id: model_id.to_string(),
                })
            }
            Some(entry) if !entry.is_ready() => {
                return Err(CacheError::FetchInProgress {
                    model_id: model_id.to_string(),
                })
            }
            Some(_) => {}
        }
        self.inner.evict_entry(&mut state, model_id, "removed").await;
        self.inner.persist(&state)
    }

    /// Remove every unpinned entry whose retention deadline has passed
    pub async fn purge_expired(&self) -> Result<Vec<String>, CacheError> {
        let mut state = self.inner.state.lock().await;
        let now = Utc::now();
        let expired: Vec<String> = state
            .index
            .entries
            .values()
            .filter(|e| e.is_ready() && e.is_expired(now) && state.pins(&e.model_id) == 0)
            .map(|e| e.model_id.clone())
            .collect();
        for model_id in &expired {
            self.inner.evict_entry(&mut state, model_id, "expired").await;
        }
        if !expired.is_empty() {
            self.inner.persist(&state)?;
        }
        info!(purged = expired.len(), "Purged expired cache entries");
        Ok(expired)
    }

    /// Snapshot of usage and every entry
    pub async fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock().await;
        CacheStats {
            root: self.inner.config.root.clone(),
            capacity_bytes: self.inner.config.capacity_bytes,
            total_bytes: state.index.total_bytes(),
            entry_count: state.index.entries.len(),
            entries: snapshot(&state),
        }
    }

    /// Entries ordered by model id
    pub async fn list(&self) -> Vec<EntrySnapshot> {
        snapshot(&*self.inner.state.lock().await)
    }

    async fn materialize(
        &self,
        model_id: &str,
        fetcher: Arc<dyn Fetcher>,
        pin: bool,
    ) -> Result<PathBuf, CacheError> {
        validate_model_id(model_id)?;

        let mut size_hint: Option<u64> = None;
        loop {
            let (tx, dest) = {
                let mut state = self.inner.state.lock().await;
                if let Some(rx) = state.inflight.get(model_id) {
                    let mut rx = rx.clone();
                    drop(state);
                    debug!(model_id, "Waiting for in-flight fetch");
                    let _ = rx.changed().await;
                    continue;
                }
                if let Some(path) = self.inner.try_hit(&mut state, model_id, pin).await? {
                    return Ok(path);
                }
                let Some(size) = size_hint else {
                    drop(state);
                    size_hint = Some(fetcher.size_hint(model_id).await?);
                    continue;
                };
                self.inner.reserve(&mut state, model_id, size).await?
            };

            let inner = self.inner.clone();
            let model = model_id.to_string();
            let task_fetcher = fetcher.clone();
            let path = tokio::spawn(async move {
                let outcome = inner.fetch_and_finalize(&model, task_fetcher, dest).await;
                drop(tx);
                outcome
            })
            .await
            .map_err(|e| CacheError::fetch(model_id, format!("fetch task failed: {e}")))??;
            if !pin {
                return Ok(path);
            }

            let mut state = self.inner.state.lock().await;
            if let Some(pins) = state.pin_ready(model_id) {
                debug!(model_id, pins, "Pinned cache entry");
                return Ok(path);
            }
            // Evicted between finalize and pin
            size_hint = None;
        }
    }
}

impl Inner {
    fn persist(&self, state: &State) -> Result<(), CacheError> {
        state.index.save(&self.index_path)?;
        self.publish(&state.index);
        Ok(())
    }

    fn publish(&self, index: &CacheIndex) {
        metrics::record_cache_usage(
            index.total_bytes(),
            self.config.capacity_bytes,
            index.entries.len() as u64,
        );
    }

    fn deadline(&self, now: DateTime<Utc>, retention: Option<Duration>) -> Option<DateTime<Utc>> {
        retention
            .and_then(|r| chrono::Duration::from_std(r).ok())
            .and_then(|r| now.checked_add_signed(r))
    }

    async fn try_hit(
        &self,
        state: &mut State,
        model_id: &str,
        pin: bool,
    ) -> Result<Option<PathBuf>, CacheError> {
        let now = Utc::now();
        let pinned = state.pins(model_id) > 0;
        let Some(entry) = state.index.entries.get(model_id) else {
            return Ok(None);
        };
        if !entry.is_ready() {
            return Ok(None);
        }
        if entry.is_expired(now) && !pinned {
            info!(model_id, "Cache entry expired, refetching");
            self.evict_entry(state, model_id, "expired").await;
            self.persist(state)?;
            return Ok(None);
        }

        let (priority, retention) = self.config.policy_for(model_id);
        let deadline = self.deadline(now, retention);
        let path = match state.index.entries.get_mut(model_id) {
            Some(entry) => {
                entry.last_access = now;
                entry.access_count += 1;
                entry.priority = priority;
                entry.retention_deadline = deadline;
                entry.path.clone()
            }
            None => return Ok(None),
        };
        self.persist(state)?;
        if pin {
            state.pin_ready(model_id);
        }
        metrics::CACHE_HITS.add(1, &[]);
        debug!(model_id, "Cache hit");
        Ok(Some(path))
    }

    async fn reserve(
        &self,
        state: &mut State,
        model_id: &str,
        size: u64,
    ) -> Result<(watch::Sender<()>, PathBuf), CacheError> {
        // A reservation without an in-flight fetch is left over from a
        // cancelled attempt.
        if state
            .index
            .entries
            .get(model_id)
            .is_some_and(|e| !e.is_ready())
        {
            state.index.entries.remove(model_id);
        }

        let victims = plan_eviction(state, self.config.capacity_bytes, model_id, size)?;
        for victim in &victims {
            self.evict_entry(state, victim, "capacity").await;
        }

        let now = Utc::now();
        let (priority, retention) = self.config.policy_for(model_id);
        let dest = self.models_dir.join(model_dir_name(model_id));
        state.index.entries.insert(
            model_id.to_string(),
            CacheEntry {
                model_id: model_id.to_string(),
                path: dest.clone(),
                size_bytes: size,
                priority,
                created_at: now,
                last_access: now,
                retention_deadline: self.deadline(now, retention),
                access_count: 0,
                state: EntryState::Reserved,
            },
        );
        if let Err(e) = self.persist(state) {
            state.index.entries.remove(model_id);
            return Err(e);
        }

        let (tx, rx) = watch::channel(());
        state.inflight.insert(model_id.to_string(), rx);
        metrics::CACHE_MISSES.add(1, &[]);
        info!(
            model_id,
            reserved = %format_gib(size),
            evicted = victims.len(),
            "Reserved cache capacity"
        );
        Ok((tx, dest))
    }

    async fn fetch_and_finalize(
        self: Arc<Self>,
        model_id: &str,
        fetcher: Arc<dyn Fetcher>,
        dest: PathBuf,
    ) -> Result<PathBuf, CacheError> {
        remove_dir(&dest).await;
        let result = match tokio::fs::create_dir_all(&dest).await {
            Ok(()) => {
                let retry = self.config.fetch_retry();
                retry_with_backoff_if(&retry, "fetch_model", CacheError::is_retryable, || {
                    fetcher.fetch(model_id, &dest)
                })
                .await
                    .map_err(|e| match e {
                        CacheError::FetchFailed { message, .. } => CacheError::FetchFailed {
                            model_id: model_id.to_string(),
                            attempts: retry.max_attempts,
                            message,
                        },
                        other => other,
                    })
            }
            Err(e) => Err(CacheError::io(&dest, e.to_string())),
        };

        let mut state = self.state.lock().await;
        state.inflight.remove(model_id);
        match result {
            Ok(actual) => self.finalize(&mut state, model_id, actual).await,
            Err(e) => {
                error!(model_id, error = %e, "Fetch failed, releasing reservation");
                self.abandon(&mut state, model_id).await;
                Err(e)
            }
        }
    }

    async fn finalize(
        &self,
        state: &mut State,
        model_id: &str,
        actual: u64,
    ) -> Result<PathBuf, CacheError> {
        // The artifact may have outgrown its size hint.
        match plan_eviction(state, self.config.capacity_bytes, model_id, actual) {
            Ok(victims) => {
                for victim in &victims {
                    self.evict_entry(state, victim, "capacity").await;
                }
            }
            Err(e) => {
                warn!(model_id, size = actual, "Fetched artifact exceeds capacity");
                self.abandon(state, model_id).await;
                return Err(e);
            }
        }

        let now = Utc::now();
        let path = match state.index.entries.get_mut(model_id) {
            Some(entry) => {
                entry.size_bytes = actual;
                entry.state = EntryState::Ready;
                entry.last_access = now;
                entry.access_count = 1;
                entry.path.clone()
            }
            None => {
                return Err(CacheError::EntryNotFound {
                    model_id: model_id.to_string(),
                })
            }
        };
        let (_, retention) = self.config.policy_for(model_id);
        let deadline = self.deadline(now, retention);
        if let Some(entry) = state.index.entries.get_mut(model_id) {
            entry.retention_deadline = deadline;
        }

        if let Err(e) = self.persist(state) {
            self.abandon(state, model_id).await;
            return Err(e);
        }
        info!(model_id, size = %format_gib(actual), path = %path.display(), "Cached model");
        Ok(path)
    }

    async fn abandon(&self, state: &mut State, model_id: &str) {
        if let Some(entry) = state.index.entries.remove(model_id) {
            remove_dir(&entry.path).await;
        }
        if let Err(e) = self.persist(state) {
            error!(model_id, error = %e, "Failed to persist cache index after releasing reservation");
        }
    }

    /// Evict unpinned entries until the index fits the capacity
    async fn shrink_to_capacity(&self, state: &mut State) -> Result<(), CacheError> {
        let capacity = self.config.capacity_bytes;
        let used = state.index.total_bytes();
        if used <= capacity {
            return Ok(());
        }
        warn!(
            used = %format_gib(used),
            capacity = %format_gib(capacity),
            "Cache holds more than its capacity, evicting"
        );
        for model_id in eviction_order(state, None) {
            if state.index.total_bytes() <= capacity {
                break;
            }
            self.evict_entry(state, &model_id, "capacity").await;
        }
        self.persist(state)
    }

    async fn evict_entry(
        &self,
        state: &mut State,
        model_id: &str,
        reason: &str,
    ) -> Option<CacheEntry> {
        let entry = state.index.entries.remove(model_id)?;
        remove_dir(&entry.path).await;
        metrics::record_eviction(reason);
        info!(
            model_id,
            reason,
            priority = %entry.priority,
            size = %format_gib(entry.size_bytes),
            "Evicted cache entry"
        );
        Some(entry)
    }
}

/// Ready, unpinned entries in eviction order, optionally skipping one model
fn eviction_order(state: &State, exclude: Option<&str>) -> Vec<String> {
    let mut candidates: Vec<&CacheEntry> = state
        .index
        .entries
        .values()
        .filter(|e| e.is_ready() && state.pins(&e.model_id) == 0)
        .filter(|e| Some(e.model_id.as_str()) != exclude)
        .collect();
    candidates.sort_by(|a, b| a.eviction_key().cmp(&b.eviction_key()));
    candidates.into_iter().map(|e| e.model_id.clone()).collect()
}

/// Victims needed so that `incoming` bytes for `model_id` fit, or
/// `CapacityExceeded` if evicting everything evictable would not suffice.
/// Nothing is evicted when the plan fails.
fn plan_eviction(
    state: &State,
    capacity: u64,
    model_id: &str,
    incoming: u64,
) -> Result<Vec<String>, CacheError> {
    let used: u64 = state
        .index
        .entries
        .values()
        .filter(|e| e.model_id != model_id)
        .map(|e| e.size_bytes)
        .sum();
    let overflow = used.saturating_add(incoming).saturating_sub(capacity);
    if overflow == 0 {
        return Ok(Vec::new());
    }

    let order = eviction_order(state, Some(model_id));
    let size_of = |id: &String| state.index.entries.get(id).map_or(0, |e| e.size_bytes);
    let evictable: u64 = order.iter().map(size_of).sum();

    let mut freed = 0u64;
    let mut victims = Vec::new();
    for id in order {
        if freed >= overflow {
            break;
        }
        freed += size_of(&id);
        victims.push(id);
    }

    if freed < overflow {
        return Err(CacheError::CapacityExceeded {
            model_id: model_id.to_string(),
            requested_bytes: incoming,
            capacity_bytes: capacity,
            reclaimable_bytes: capacity.saturating_sub(used) + evictable,
        });
    }
    Ok(victims)
}

fn snapshot(state: &State) -> Vec<EntrySnapshot> {
    state
        .index
        .entries
        .values()
        .map(|e| EntrySnapshot {
            entry: e.clone(),
            pins: state.pins(&e.model_id),
        })
        .collect()
}

async fn remove_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cache directory"),
    }
}
