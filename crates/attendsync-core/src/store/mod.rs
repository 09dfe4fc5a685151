//! Local record store.
//!
//! A versioned, directory-backed database holding attendance scans, form
//! submissions, login attempts and key/value cache entries until they have
//! been reconciled with the server. All access goes through one shared
//! [`StoreHandle`].

pub mod database;
pub mod error;
pub mod handle;
pub mod lease;
pub mod schema;
pub mod table;

use std::time::Duration;

pub use database::{Database, EvictionCandidate, RepairReport};
pub use error::StoreError;
pub use handle::{OpenOutcome, StoreHandle, StoreMode};
pub use schema::{CURRENT_VERSION, DATABASE_NAME};

/// Default local-store quota (50 MiB).
pub const DEFAULT_QUOTA_BYTES: u64 = 50 * 1024 * 1024;

/// Pause before retrying an open that was blocked by another session.
pub const DEFAULT_BLOCKED_RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub version: u32,
    pub quota_bytes: Option<u64>,
    pub blocked_retry_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            quota_bytes: Some(DEFAULT_QUOTA_BYTES),
            blocked_retry_delay: Duration::from_millis(DEFAULT_BLOCKED_RETRY_DELAY_MS),
        }
    }
}
