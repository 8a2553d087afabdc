// lib.rs - Offline-first sync engine for warehouse scanner stations

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod connectivity;
pub mod notify;
pub mod queue;
pub mod request;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod time;
pub mod transport;

pub use connectivity::{ConnectivityMonitor, ManualConnectivity};
pub use notify::{Listeners, Subscription};
pub use queue::{DrainReport, OfflineQueue, QueueConfig, QueueError, DEFAULT_MAX_RETRIES};
pub use request::{Headers, Method, QueueStatus, QueuedRequest};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotError, SnapshotStore};
pub use state::{
    CachedOperation, OperationKey, ScannerState, ScannerStateManager, StagedEntity, StateConfig,
    DEFAULT_CACHE_TTL_MS,
};
pub use store::{MemoryRequestStore, RequestStore, SqliteRequestStore, StoreError};
pub use time::{Clock, ManualClock, SystemClock, UnixTimeMs};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport, TransportError};
