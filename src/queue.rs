use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::notify::{Listeners, Subscription};
use crate::request::{Headers, Method, QueueStatus, QueuedRequest};
use crate::store::{RequestStore, StoreError};
use crate::time::{Clock, UnixTimeMs};
use crate::transport::{HttpResponse, HttpTransport, TransportError};

/// Default retry ceiling for a queued request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_retries == 0 {
            return Err(QueueError::InvalidConfig("max_retries must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Sentinel, not a true failure: the caller was offline and the
    /// request is durably queued for later delivery.
    #[error("offline: request {id} queued for later delivery")]
    OfflineQueued { id: String },

    /// The resource changed server-side since the request was created
    /// (HTTP 409). The request is NOT queued; the calling layer decides
    /// between re-fetch-and-merge and dropping the operation.
    #[error("conflict: resource changed server-side")]
    Conflict { body: String },

    /// Non-2xx response from a direct attempt. The request has already
    /// been queued for replay by the time this is returned.
    #[error("request failed with HTTP {status}")]
    Http { status: u16, body: String },

    /// Transport-level failure from a direct attempt; also queued.
    #[error("network error: {0}")]
    Network(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one drain pass over the persisted queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// False when the pass was skipped (offline, or another pass active).
    pub ran: bool,
    pub attempted: usize,
    pub succeeded: usize,
    /// Failures re-persisted with an incremented retry count.
    pub retried: usize,
    /// Subset of failures that were HTTP 409 conflicts.
    pub conflicts: usize,
    /// Requests abandoned after exhausting their retry budget.
    pub dropped: usize,
}

/// Durable queue of mutating HTTP requests.
///
/// Accepts requests while offline (or when a direct attempt fails),
/// persists them through the injected [`RequestStore`], and drains them
/// FIFO with bounded retries once connectivity returns. Queue depth and
/// connectivity are republished to subscribers after every enqueue,
/// drain pass, and online/offline transition.
pub struct OfflineQueue<B = serde_json::Value> {
    store: Arc<dyn RequestStore<B>>,
    transport: Arc<dyn HttpTransport>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    listeners: Listeners<QueueStatus>,
    sync_in_progress: AtomicBool,
    last_sync: Mutex<Option<UnixTimeMs>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<B> OfflineQueue<B>
where
    B: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Build the queue and start watching for reconnects. Must be called
    /// from within a tokio runtime.
    pub fn new(
        store: Arc<dyn RequestStore<B>>,
        transport: Arc<dyn HttpTransport>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Result<Arc<Self>, QueueError> {
        config.validate()?;

        let queue = Arc::new(Self {
            store,
            transport,
            connectivity,
            clock,
            config,
            listeners: Listeners::new(),
            sync_in_progress: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            watcher: Mutex::new(None),
        });

        let handle = queue.spawn_reconnect_watcher();
        *lock(&queue.watcher) = Some(handle);

        Ok(queue)
    }

    /// Drains automatically on every offline→online edge and republishes
    /// status on every transition. Connectivity-driven only; there is no
    /// fixed drain timer.
    fn spawn_reconnect_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.connectivity.watch();
        // Baseline read before the task is spawned, atomically with the
        // subscription. Reading it inside the task would lose a
        // transition that lands before the task's first poll.
        let mut was_online = *rx.borrow();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                let Some(queue) = weak.upgrade() else { break };

                if online && !was_online {
                    info!("connectivity restored, draining offline queue");
                    if let Err(err) = queue.process_queue().await {
                        warn!(error = %err, "automatic drain failed");
                    }
                } else if !online && was_online {
                    info!("connectivity lost, queueing mutations locally");
                    queue.broadcast_status().await;
                }
                was_online = online;
            }
        })
    }

    /// Persist a request for later delivery without attempting it now.
    #[instrument(skip(self, body, headers), fields(method = %method, url = %url))]
    pub async fn queue_request(
        &self,
        method: Method,
        url: &str,
        body: Option<B>,
        headers: Option<&Headers>,
    ) -> Result<QueuedRequest<B>, QueueError> {
        url::Url::parse(url).map_err(|e| QueueError::InvalidRequest(e.to_string()))?;

        let request = QueuedRequest::new(
            method,
            url,
            body,
            headers,
            self.clock.now(),
            self.config.max_retries,
        );
        // Reject here what the transport would reject on every replay.
        crate::transport::validate_headers(&request.headers)
            .map_err(|e| QueueError::InvalidRequest(e.to_string()))?;
        self.store.save(&request).await?;

        info!(id = %request.id, "request queued");
        self.broadcast_status().await;

        Ok(request)
    }

    /// Primary entry point for mutating calls.
    ///
    /// Online: attempts the call directly and returns the response on
    /// success. A 409 is returned as [`QueueError::Conflict`] without
    /// queueing; any other failure queues the request for replay and
    /// then surfaces the original error, so the caller learns "not
    /// applied yet, but queued" rather than "succeeded".
    ///
    /// Offline: skips the attempt, queues, and returns the
    /// [`QueueError::OfflineQueued`] sentinel.
    pub async fn make_request(
        &self,
        method: Method,
        url: &str,
        body: Option<B>,
        headers: Option<&Headers>,
    ) -> Result<HttpResponse, QueueError> {
        if !self.connectivity.is_online() {
            let queued = self.queue_request(method, url, body, headers).await?;
            return Err(QueueError::OfflineQueued { id: queued.id });
        }

        let body_bytes = encode_body(body.as_ref())?;
        let merged = crate::request::merged_headers(headers);

        match self
            .transport
            .send(method, url, body_bytes.as_deref(), &merged)
            .await
        {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) if response.is_conflict() => {
                warn!(url, "conflict on direct attempt, not queueing");
                Err(QueueError::Conflict {
                    body: response.body_text(),
                })
            }
            Ok(response) => {
                let status = response.status;
                warn!(url, status, "direct attempt failed, queueing for replay");
                self.queue_request(method, url, body, headers).await?;
                Err(QueueError::Http {
                    status,
                    body: response.body_text(),
                })
            }
            Err(TransportError::Network(message)) => {
                warn!(url, error = %message, "network error, queueing for replay");
                self.queue_request(method, url, body, headers).await?;
                Err(QueueError::Network(message))
            }
            Err(err) => Err(QueueError::InvalidRequest(err.to_string())),
        }
    }

    /// Drain the persisted queue in enqueue order.
    ///
    /// Single-flight: a call arriving while a pass is active is a no-op
    /// (`ran == false`); anything enqueued mid-pass waits for the next
    /// invocation. Short-circuits when offline.
    #[instrument(skip(self))]
    pub async fn process_queue(&self) -> Result<DrainReport, QueueError> {
        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(DrainReport::default());
        }
        let _guard = DrainGuard(&self.sync_in_progress);

        if !self.connectivity.is_online() {
            return Ok(DrainReport::default());
        }

        let pending = self.store.load_all().await?;
        let mut report = DrainReport {
            ran: true,
            ..DrainReport::default()
        };

        for request in pending {
            report.attempted += 1;

            let body_bytes = encode_body(request.body.as_ref())?;
            let outcome = self
                .transport
                .send(
                    request.method,
                    &request.url,
                    body_bytes.as_deref(),
                    &request.headers,
                )
                .await;

            match outcome {
                Ok(response) if response.is_success() => {
                    self.store.remove(&request.id).await?;
                    report.succeeded += 1;
                }
                failed => {
                    if matches!(&failed, Ok(response) if response.is_conflict()) {
                        // Counted against the retry budget like any other
                        // failure; the distinct log line is what callers
                        // key their refresh logic on.
                        warn!(id = %request.id, url = %request.url, "conflict while replaying queued request");
                        report.conflicts += 1;
                    }

                    if request.next_failure_is_terminal() {
                        self.store.remove(&request.id).await?;
                        report.dropped += 1;
                        error!(
                            id = %request.id,
                            url = %request.url,
                            attempts = request.retry_count + 1,
                            "abandoning request after exhausting retries"
                        );
                    } else {
                        let mut updated = request.clone();
                        updated.retry_count += 1;
                        self.store.save(&updated).await?;
                        report.retried += 1;
                    }
                }
            }
        }

        *lock(&self.last_sync) = Some(self.clock.now());
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            retried = report.retried,
            conflicts = report.conflicts,
            dropped = report.dropped,
            "drain pass complete"
        );
        self.broadcast_status().await;

        Ok(report)
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        Ok(QueueStatus {
            is_online: self.connectivity.is_online(),
            queue_length: self.store.len().await?,
            last_sync_time: *lock(&self.last_sync),
        })
    }

    /// Drop every pending request.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.store.clear().await?;
        self.broadcast_status().await;
        Ok(())
    }

    /// Register a status listener; dropping the handle unsubscribes.
    pub fn subscribe(&self, listener: impl Fn(&QueueStatus) + Send + Sync + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Stop the reconnect watcher and drop all listeners. Pending
    /// requests stay persisted.
    pub fn close(&self) {
        if let Some(handle) = lock(&self.watcher).take() {
            handle.abort();
        }
        self.listeners.clear();
    }

    async fn broadcast_status(&self) {
        match self.status().await {
            Ok(status) => self.listeners.notify(&status),
            Err(err) => warn!(error = %err, "failed to compute queue status"),
        }
    }
}

impl<B> Drop for OfflineQueue<B> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.watcher).take() {
            handle.abort();
        }
    }
}

fn encode_body<B: Serialize>(body: Option<&B>) -> Result<Option<Vec<u8>>, QueueError> {
    body.map(|b| serde_json::to_vec(b).map_err(|e| QueueError::Serialization(e.to_string())))
        .transpose()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases the single-flight guard even when a storage error unwinds
/// the drain early.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
