use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::notify::{Listeners, Subscription};
use crate::queue::OfflineQueue;
use crate::request::QueueStatus;
use crate::snapshot::SnapshotStore;
use crate::time::{Clock, UnixTimeMs};

/// Default time-to-live for cached operation payloads: five minutes.
pub const DEFAULT_CACHE_TTL_MS: u64 = 300_000;

#[derive(Clone, Debug)]
pub struct StateConfig {
    pub default_cache_ttl_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            default_cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
        }
    }
}

/// Identity of one operation step within a work order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub work_order_id: String,
    pub operation_seq: u32,
}

impl OperationKey {
    pub fn new(work_order_id: impl Into<String>, operation_seq: u32) -> Self {
        Self {
            work_order_id: work_order_id.into(),
            operation_seq,
        }
    }
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.work_order_id, self.operation_seq)
    }
}

/// A license plate reserved at a station but not yet confirmed
/// server-side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagedEntity<P = serde_json::Value> {
    pub id: String,
    pub payload: P,
    pub reserved_at: UnixTimeMs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedOperation<D = serde_json::Value> {
    pub data: D,
    pub cached_at: UnixTimeMs,
    pub ttl_ms: u64,
}

impl<D> CachedOperation<D> {
    pub fn is_expired(&self, now: UnixTimeMs) -> bool {
        now.millis_since(self.cached_at) > self.ttl_ms
    }
}

/// Full observable state of a scanner station.
///
/// `state()` hands out a clone; mutating the copy never touches the
/// manager's own state.
#[derive(Clone, Debug, PartialEq)]
pub struct ScannerState<P = serde_json::Value, D = serde_json::Value> {
    pub current_work_order_id: Option<String>,
    pub current_operation_seq: Option<u32>,
    pub staged_lps: HashMap<u32, Vec<StagedEntity<P>>>,
    pub operation_cache: HashMap<OperationKey, CachedOperation<D>>,
    pub is_online: bool,
    pub queue_length: usize,
    pub last_sync_time: Option<UnixTimeMs>,
}

impl<P, D> ScannerState<P, D> {
    fn empty(is_online: bool) -> Self {
        Self {
            current_work_order_id: None,
            current_operation_seq: None,
            staged_lps: HashMap::new(),
            operation_cache: HashMap::new(),
            is_online,
            queue_length: 0,
            last_sync_time: None,
        }
    }
}

/// On-disk shape of the state. Connectivity and queue depth are live
/// signals and are seeded fresh on reload; the last sync time is kept
/// so a restarted station still knows when it last caught up. Maps go
/// out as entry lists so the wire shape stays stable across map
/// reorderings.
#[derive(Serialize, Deserialize)]
struct PersistedState<P, D> {
    current_work_order_id: Option<String>,
    current_operation_seq: Option<u32>,
    staged_lps: Vec<(u32, Vec<StagedEntity<P>>)>,
    operation_cache: Vec<(OperationKey, CachedOperation<D>)>,
    last_sync_time: Option<UnixTimeMs>,
}

/// Operational state for one scanner station: the focused work-order
/// operation, staged license plates per operation step, and a TTL cache
/// of fetched operation payloads.
///
/// Every mutation persists a snapshot and notifies subscribers.
/// Persistence failures are logged and swallowed; the in-memory state
/// is always the source of truth for the running session.
pub struct ScannerStateManager<P = serde_json::Value, D = serde_json::Value> {
    inner: Mutex<ScannerState<P, D>>,
    snapshot_store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    config: StateConfig,
    listeners: Listeners<ScannerState<P, D>>,
    queue_subscription: Mutex<Option<Subscription>>,
}

impl<P, D> ScannerStateManager<P, D>
where
    P: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    D: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Build the manager, reloading any previously persisted state. A
    /// missing, corrupt, or unreadable snapshot degrades to a clean
    /// state rather than failing construction.
    ///
    /// The queue's status stream is not wired automatically: call
    /// [`attach_queue`](Self::attach_queue) afterwards (or construct via
    /// [`with_queue`](Self::with_queue)), otherwise `is_online` and
    /// `queue_length` never move past their initial values.
    pub fn new(
        snapshot_store: Arc<dyn SnapshotStore>,
        connectivity: &dyn ConnectivityMonitor,
        clock: Arc<dyn Clock>,
        config: StateConfig,
    ) -> Arc<Self> {
        let mut state = ScannerState::empty(connectivity.is_online());

        match snapshot_store.load() {
            Ok(Some(bytes)) => match ciborium::from_reader::<PersistedState<P, D>, _>(&bytes[..]) {
                Ok(persisted) => {
                    state.current_work_order_id = persisted.current_work_order_id;
                    state.current_operation_seq = persisted.current_operation_seq;
                    state.staged_lps = persisted.staged_lps.into_iter().collect();
                    state.operation_cache = persisted.operation_cache.into_iter().collect();
                    state.last_sync_time = persisted.last_sync_time;
                    info!("scanner state restored from snapshot");
                }
                Err(err) => {
                    warn!(error = %err, "snapshot payload unreadable, starting clean");
                }
            },
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "snapshot load failed, starting clean");
            }
        }

        Arc::new(Self {
            inner: Mutex::new(state),
            snapshot_store,
            clock,
            config,
            listeners: Listeners::new(),
            queue_subscription: Mutex::new(None),
        })
    }

    /// One-step construction with the queue's status stream already
    /// attached.
    pub fn with_queue<B>(
        snapshot_store: Arc<dyn SnapshotStore>,
        connectivity: &dyn ConnectivityMonitor,
        clock: Arc<dyn Clock>,
        config: StateConfig,
        queue: &OfflineQueue<B>,
    ) -> Arc<Self>
    where
        B: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let manager = Self::new(snapshot_store, connectivity, clock, config);
        manager.attach_queue(queue);
        manager
    }

    /// Mirror the queue's status into the state so subscribers get one
    /// coherent picture. The subscription lives until `destroy`.
    pub fn attach_queue<B>(self: &Arc<Self>, queue: &OfflineQueue<B>)
    where
        B: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let subscription = queue.subscribe(move |status: &QueueStatus| {
            if let Some(manager) = weak.upgrade() {
                let status = *status;
                manager.commit(|state| {
                    state.is_online = status.is_online;
                    state.queue_length = status.queue_length;
                    state.last_sync_time = status.last_sync_time;
                });
            }
        });
        *lock(&self.queue_subscription) = Some(subscription);
    }

    // ------------------------------------------------------------------
    // Focus
    // ------------------------------------------------------------------

    pub fn set_current_operation(&self, work_order_id: impl Into<String>, operation_seq: u32) {
        let work_order_id = work_order_id.into();
        self.commit(|state| {
            state.current_work_order_id = Some(work_order_id);
            state.current_operation_seq = Some(operation_seq);
        });
    }

    pub fn current_operation(&self) -> Option<(String, u32)> {
        let state = lock(&self.inner);
        match (&state.current_work_order_id, state.current_operation_seq) {
            (Some(id), Some(seq)) => Some((id.clone(), seq)),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Staged license plates
    // ------------------------------------------------------------------

    /// Stage an LP for an operation step. Re-staging an already staged
    /// LP replaces its payload and refreshes the reservation timestamp;
    /// it never produces a duplicate entry.
    pub fn stage_lp(&self, operation_seq: u32, id: impl Into<String>, payload: P) {
        let entity = StagedEntity {
            id: id.into(),
            payload,
            reserved_at: self.clock.now(),
        };
        self.commit(|state| {
            let staged = state.staged_lps.entry(operation_seq).or_default();
            if let Some(existing) = staged.iter_mut().find(|e| e.id == entity.id) {
                *existing = entity;
            } else {
                staged.push(entity);
            }
        });
    }

    /// Remove one staged LP. A miss is a no-op, not an error.
    pub fn unstage_lp(&self, operation_seq: u32, id: &str) {
        self.commit(|state| {
            if let Some(staged) = state.staged_lps.get_mut(&operation_seq) {
                staged.retain(|e| e.id != id);
                if staged.is_empty() {
                    state.staged_lps.remove(&operation_seq);
                }
            }
        });
    }

    pub fn staged_lps(&self, operation_seq: u32) -> Vec<StagedEntity<P>> {
        lock(&self.inner)
            .staged_lps
            .get(&operation_seq)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_staged_lps(&self) -> HashMap<u32, Vec<StagedEntity<P>>> {
        lock(&self.inner).staged_lps.clone()
    }

    pub fn clear_staged_lps(&self, operation_seq: u32) {
        self.commit(|state| {
            state.staged_lps.remove(&operation_seq);
        });
    }

    // ------------------------------------------------------------------
    // Operation cache
    // ------------------------------------------------------------------

    pub fn cache_operation_data(&self, key: OperationKey, data: D) {
        self.cache_operation_data_with_ttl(key, data, self.config.default_cache_ttl_ms);
    }

    pub fn cache_operation_data_with_ttl(&self, key: OperationKey, data: D, ttl_ms: u64) {
        let entry = CachedOperation {
            data,
            cached_at: self.clock.now(),
            ttl_ms,
        };
        self.commit(|state| {
            state.operation_cache.insert(key, entry);
        });
    }

    /// Fetch cached data for an operation. An expired entry is evicted
    /// on the spot and reported as a miss, so a hit is always fresh.
    pub fn cached_operation_data(&self, key: &OperationKey) -> Option<D> {
        let now = self.clock.now();

        let (result, evicted) = {
            let mut state = lock(&self.inner);
            match state.operation_cache.get(key) {
                Some(entry) if entry.is_expired(now) => {
                    state.operation_cache.remove(key);
                    (None, true)
                }
                Some(entry) => (Some(entry.data.clone()), false),
                None => (None, false),
            }
        };

        if evicted {
            self.after_mutation();
        }
        result
    }

    pub fn clear_operation_cache(&self, key: &OperationKey) {
        self.commit(|state| {
            state.operation_cache.remove(key);
        });
    }

    pub fn clear_all_cache(&self) {
        self.commit(|state| {
            state.operation_cache.clear();
        });
    }

    /// Sweep every expired cache entry out in one pass. Returns the
    /// number of evicted entries; persists and notifies only when
    /// something was actually removed.
    pub fn cleanup_expired_cache(&self) -> usize {
        let now = self.clock.now();
        let removed = {
            let mut state = lock(&self.inner);
            let before = state.operation_cache.len();
            state.operation_cache.retain(|_, entry| !entry.is_expired(now));
            before - state.operation_cache.len()
        };

        if removed > 0 {
            info!(removed, "evicted expired operation cache entries");
            self.after_mutation();
        }
        removed
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Reset focus, staging, and cache. Connectivity and queue fields
    /// are runtime signals and are left as-is.
    pub fn clear_all(&self) {
        self.commit(|state| {
            state.current_work_order_id = None;
            state.current_operation_seq = None;
            state.staged_lps.clear();
            state.operation_cache.clear();
        });
    }

    /// Defensive copy of the full state.
    pub fn state(&self) -> ScannerState<P, D> {
        lock(&self.inner).clone()
    }

    /// Register a state listener; dropping the handle unsubscribes.
    pub fn subscribe(
        &self,
        listener: impl Fn(&ScannerState<P, D>) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Detach from the queue and drop all listeners. State stays
    /// persisted for the next session.
    pub fn destroy(&self) {
        lock(&self.queue_subscription).take();
        self.listeners.clear();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Mutate under the lock, then notify and persist from a clone taken
    /// after the lock is released. Listener callbacks never run with the
    /// state lock held.
    fn commit<R>(&self, mutate: impl FnOnce(&mut ScannerState<P, D>) -> R) -> R {
        let result = {
            let mut state = lock(&self.inner);
            mutate(&mut state)
        };
        self.after_mutation();
        result
    }

    fn after_mutation(&self) {
        let snapshot = self.state();
        self.listeners.notify(&snapshot);
        self.persist(&snapshot);
    }

    fn persist(&self, state: &ScannerState<P, D>) {
        let persisted = PersistedState {
            current_work_order_id: state.current_work_order_id.clone(),
            current_operation_seq: state.current_operation_seq,
            staged_lps: state
                .staged_lps
                .iter()
                .map(|(seq, lps)| (*seq, lps.clone()))
                .collect(),
            operation_cache: state
                .operation_cache
                .iter()
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect(),
            last_sync_time: state.last_sync_time,
        };

        let mut bytes = Vec::new();
        if let Err(err) = ciborium::into_writer(&persisted, &mut bytes) {
            warn!(error = %err, "failed to serialize scanner state, snapshot skipped");
            return;
        }
        if let Err(err) = self.snapshot_store.save(&bytes) {
            warn!(error = %err, "failed to persist scanner state, continuing in memory");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
