//! Data types shared by the store, the cache manager and the sync engine.
//!
//! This module provides:
//! - Attendance, form and login records with their sync state
//! - Scan details captured at the kiosk
//! - Key/value cache entries
//! - Storage usage snapshots

pub mod entry;
mod lenient;
pub mod record;
pub mod scan;
pub mod usage;

pub use entry::CacheDataEntry;
pub use lenient::{count_of, is_set, value_to_millis};
pub use record::{
    date_for_timestamp, now_millis, AttendanceRecord, FormSubmission, LoginAttempt, NewRecord,
    PendingCounts, Record, RecordId, StoreKind, SyncState,
};
pub use scan::{ScanData, ScanType, DEFAULT_SCAN_LOCATION};
pub use usage::{BucketUsage, StorageBucket, StorageUsageSnapshot};
