//! Recording scans while offline.
//!
//! Every scan is validated, written to the local store and counted as
//! pending. A write rejected for lack of space triggers an emergency
//! cleanup and is retried once.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::events::{EventBus, SyncEvent};
use crate::models::{now_millis, NewRecord, RecordId, ScanData, ScanType};
use crate::store::{StoreError, StoreHandle};

const STUDENT_QR_PREFIX: &str = "KES-SMART-STUDENT-";
const LRN_DIGITS: usize = 12;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Please select a subject first")]
    MissingSubject,

    #[error("Student identifier is required")]
    MissingStudent,

    #[error("Invalid LRN format. LRN must be 12 digits.")]
    InvalidLrn(String),

    #[error("Invalid form type: {0}")]
    InvalidFormType(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Student id embedded in a QR payload of the form base64(`KES-SMART-STUDENT-{id}-{year}`).
pub fn decode_student_qr(qr_data: &str) -> Option<String> {
    let bytes = STANDARD.decode(qr_data.trim()).ok()?;
    let decoded = String::from_utf8(bytes).ok()?;
    let rest = decoded.strip_prefix(STUDENT_QR_PREFIX)?;
    let (id, year) = rest.split_once('-')?;
    let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if digits(id) && digits(year) && year.len() == 4 {
        Some(id.to_string())
    } else {
        None
    }
}

pub fn validate_lrn(lrn: &str) -> Result<(), CaptureError> {
    if lrn.len() == LRN_DIGITS && lrn.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(CaptureError::InvalidLrn(lrn.to_string()))
    }
}

/// Subject and operator details shared by every scan in a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanContext {
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub teacher_id: Option<String>,
    pub teacher_name: Option<String>,
}

#[derive(Clone)]
pub struct ScanRecorder {
    store: StoreHandle,
    cache: Option<CacheManager>,
    events: EventBus,
}

impl ScanRecorder {
    pub fn new(store: StoreHandle, events: EventBus) -> Self {
        Self {
            store,
            cache: None,
            events,
        }
    }

    /// Escalate to `cache` when the store runs out of space.
    pub fn with_cache_manager(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn record_qr(&self, qr_data: &str, context: &ScanContext) -> Result<RecordId, CaptureError> {
        let qr_data = qr_data.trim();
        if qr_data.is_empty() {
            return Err(CaptureError::MissingStudent);
        }
        let mut data = scan_data(ScanType::Qr, context)?;
        data.student_id = decode_student_qr(qr_data);
        data.qr_data = Some(qr_data.to_string());
        self.record_scan(ScanType::Qr, data).await
    }

    pub async fn record_lrn(&self, lrn: &str, context: &ScanContext) -> Result<RecordId, CaptureError> {
        let lrn = lrn.trim();
        if lrn.is_empty() {
            return Err(CaptureError::MissingStudent);
        }
        validate_lrn(lrn)?;
        let mut data = scan_data(ScanType::Lrn, context)?;
        data.lrn = Some(lrn.to_string());
        self.record_scan(ScanType::Lrn, data).await
    }

    pub async fn record_manual(
        &self,
        student_id: &str,
        student_name: Option<&str>,
        context: &ScanContext,
    ) -> Result<RecordId, CaptureError> {
        let student_id = student_id.trim();
        if student_id.is_empty() {
            return Err(CaptureError::MissingStudent);
        }
        let mut data = scan_data(ScanType::Manual, context)?;
        data.student_id = Some(student_id.to_string());
        data.student_name = student_name.map(str::to_string);
        self.record_scan(ScanType::Manual, data).await
    }

    pub async fn record_form(&self, form_type: &str, data: Value) -> Result<RecordId, CaptureError> {
        crate::api::payload::validate_form_type(form_type)
            .map_err(|_| CaptureError::InvalidFormType(form_type.to_string()))?;
        self.write(NewRecord::Form {
            form_type: form_type.to_string(),
            data,
            timestamp: now_millis(),
        })
        .await
    }

    pub async fn record_login(&self, username: &str, role: Option<&str>) -> Result<RecordId, CaptureError> {
        self.write(NewRecord::Login {
            username: username.to_string(),
            role: role.map(str::to_string),
            timestamp: now_millis(),
        })
        .await
    }

    async fn record_scan(&self, scan_type: ScanType, data: ScanData) -> Result<RecordId, CaptureError> {
        let record = NewRecord::Attendance {
            scan_type,
            scan_data: data,
            timestamp: now_millis(),
        };
        let id = self.write(record).await?;
        info!(record_id = %id, scan_type = %scan_type, "Attendance recorded offline");
        Ok(id)
    }

    async fn write(&self, record: NewRecord) -> Result<RecordId, CaptureError> {
        let id = match self.store.add_record(record.clone()).await {
            Ok(id) => id,
            Err(e) if e.is_quota_exceeded() => match &self.cache {
                Some(cache) => {
                    warn!(error = %e, "Offline store full, cleaning up before retrying");
                    cache.handle_quota_exceeded().await;
                    self.store.add_record(record).await?
                }
                None => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        };
        let counts = self.store.pending_counts().await;
        self.events.emit(SyncEvent::pending(counts));
        Ok(id)
    }
}

fn scan_data(scan_type: ScanType, context: &ScanContext) -> Result<ScanData, CaptureError> {
    let subject_id = context
        .subject_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(CaptureError::MissingSubject)?;

    let mut data = ScanData {
        subject_id: Some(subject_id.to_string()),
        subject_name: context.subject_name.clone(),
        teacher_id: context.teacher_id.clone(),
        teacher_name: context.teacher_name.clone(),
        scan_method: Some(scan_type.method_label().to_string()),
        ..ScanData::default()
    };
    if let Some(location) = context.location.as_deref().filter(|l| !l.trim().is_empty()) {
        data.scan_location = location.to_string();
    }
    if let Some(notes) = &context.notes {
        data.scan_notes = notes.clone();
    }
    Ok(data)
}
