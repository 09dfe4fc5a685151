use thiserror::Error;

use crate::models::RecordId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Schema upgrade from v{installed} to v{requested} blocked by {holders} open connection(s)")]
    SchemaBlocked {
        installed: u32,
        requested: u32,
        holders: usize,
    },

    #[error("Requested schema v{requested} is older than installed v{installed}")]
    VersionTooLow { installed: u32, requested: u32 },

    #[error("Record {id} not found in {store}")]
    NotFound { store: String, id: RecordId },

    #[error("Malformed record in {store}: {reason}")]
    Malformed { store: String, reason: String },

    #[error("Storage quota exceeded: {used} of {quota} bytes in use")]
    QuotaExceeded { used: u64, quota: u64 },

    #[error("Unknown store: {0}")]
    UnknownStore(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}
