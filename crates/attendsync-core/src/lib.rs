//! attendsync core - offline capture and sync for KES-SMART attendance.
//!
//! Scans are written to a versioned local record store while the kiosk is
//! offline, then reconciled with the server in batches once connectivity
//! returns. A cache manager keeps local storage under quota.

pub mod api;
pub mod auth;
pub mod cache;
pub mod capture;
pub mod config;
pub mod events;
pub mod models;
pub mod monitor;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod utils;

pub use api::{ApiClient, ApiError};
pub use auth::{Session, SessionData};
pub use cache::{CacheManager, CleanupReport, CleanupResult, CleanupStats, CleanupTier, ResponseCache};
pub use capture::{CaptureError, ScanContext, ScanRecorder};
pub use config::Config;
pub use events::{EventBus, SyncEvent, SyncResults, SyncStage};
pub use models::{NewRecord, PendingCounts, Record, RecordId, StoreKind};
pub use monitor::{MonitorState, SyncMonitor, Toast, ToastLevel};
pub use runtime::Runtime;
pub use store::{OpenOutcome, StoreError, StoreHandle, StoreMode, StoreOptions};
pub use sync::{
    Connectivity, ConnectivityProbe, CoordinatorHandle, Reconciler, RetryPolicy, SyncCoordinator,
    SyncEngine, SyncSummary,
};
