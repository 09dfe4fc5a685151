//! Reconciliation client for the KES-SMART server.
//!
//! This module provides the `ApiClient` for replaying offline attendance
//! and form submissions, plus the wire payloads those endpoints accept.
//!
//! Requests carry the bearer token of the saved session when one exists.

pub mod client;
pub mod error;
pub mod payload;

pub use client::{ApiClient, DEFAULT_MAX_BATCH_SIZE};
pub use error::ApiError;
pub use payload::{
    dedup_key, AttendancePayload, BatchResponse, FormPayload, FormResponse, RecordAck, VersionInfo,
};
