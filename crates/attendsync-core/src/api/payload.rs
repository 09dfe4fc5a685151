//! Wire types for the reconciliation endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{AttendanceRecord, FormSubmission, RecordId, ScanType};

use super::ApiError;

/// One attendance record as submitted to `api/sync-attendance.php`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendancePayload {
    pub client_record_id: RecordId,
    pub scan_type: ScanType,
    pub action: &'static str,
    pub student_id: Option<String>,
    pub qr_data: Option<String>,
    pub lrn: Option<String>,
    pub subject_id: Option<String>,
    pub location: String,
    pub notes: String,
    pub teacher_id: Option<String>,
    /// Capture time, RFC 3339.
    pub timestamp: String,
    /// Capture time, epoch milliseconds as stored locally.
    pub offline_timestamp: i64,
    pub date: String,
    pub dedup_key: String,
    pub offline_sync: bool,
}

impl AttendancePayload {
    pub fn from_record(record: &AttendanceRecord) -> Self {
        let scan = &record.scan_data;
        let student_id = record
            .student_id
            .clone()
            .or_else(|| scan.student_key().map(str::to_string));
        let date = record.capture_date();
        let timestamp = DateTime::<Utc>::from_timestamp_millis(record.timestamp)
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            .unwrap_or_default();

        Self {
            client_record_id: record.id,
            scan_type: record.scan_type,
            action: record.scan_type.action(),
            dedup_key: dedup_key(student_id.as_deref(), scan.subject_id.as_deref(), &date),
            student_id,
            qr_data: scan.qr_data.clone(),
            lrn: scan.lrn.clone(),
            subject_id: scan.subject_id.clone(),
            location: scan.scan_location.clone(),
            notes: scan.scan_notes.clone(),
            teacher_id: scan.teacher_id.clone(),
            timestamp,
            offline_timestamp: record.timestamp,
            date,
            offline_sync: true,
        }
    }
}

/// Server-side idempotency key: one attendance mark per student, subject and day.
pub fn dedup_key(student: Option<&str>, subject: Option<&str>, date: &str) -> String {
    format!("{}:{}:{}", student.unwrap_or(""), subject.unwrap_or(""), date)
}

#[derive(Debug, Serialize)]
pub(crate) struct AttendanceBatch<'a> {
    #[serde(rename = "offlineData")]
    pub offline_data: &'a [AttendancePayload],
}

/// Response from `api/sync-attendance.php`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub error_count: usize,
    #[serde(default)]
    pub results: Vec<RecordAck>,
}

/// Per-record outcome, in the order the records were submitted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecordAck {
    #[serde(default)]
    pub success: bool,
    #[serde(default, deserialize_with = "id_or_string")]
    pub student_id: Option<String>,
    #[serde(default)]
    pub student_name: Option<String>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
    /// Already recorded by an earlier submission.
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub status: Option<String>,
}

impl RecordAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn error_message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "Rejected by server".to_string())
    }
}

fn id_or_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A queued form submission bound for `api/sync-{form_type}.php`.
#[derive(Debug, Clone, PartialEq)]
pub struct FormPayload {
    pub client_record_id: RecordId,
    pub form_type: String,
    pub data: Value,
}

impl FormPayload {
    pub fn from_record(form: &FormSubmission) -> Result<Self, ApiError> {
        validate_form_type(&form.form_type)?;
        Ok(Self {
            client_record_id: form.id,
            form_type: form.form_type.clone(),
            data: form.data.clone(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("api/sync-{}.php", self.form_type)
    }
}

/// Form types become part of the endpoint path, so only `[A-Za-z0-9_-]` is allowed.
pub fn validate_form_type(form_type: &str) -> Result<(), ApiError> {
    let valid = !form_type.is_empty()
        && form_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::InvalidPayload(format!("invalid form type {:?}", form_type)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FormResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

/// Response from `api/check-version.php`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Served from the response cache rather than the network.
    #[serde(skip)]
    pub from_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScanData, SyncState};

    fn record() -> AttendanceRecord {
        AttendanceRecord {
            id: RecordId(7),
            scan_type: ScanType::Qr,
            scan_data: ScanData {
                subject_id: Some("5".to_string()),
                qr_data: Some("S-42".to_string()),
                student_id: Some("42".to_string()),
                teacher_id: Some("3".to_string()),
                ..ScanData::default()
            },
            timestamp: 1_792_393_500_000,
            date: String::new(),
            student_id: Some("42".to_string()),
            sync: SyncState::default(),
            created_at: None,
        }
    }

    #[test]
    fn test_attendance_payload_shape() {
        let payload = AttendancePayload::from_record(&record());
        let json = serde_json::to_value(&payload).expect("json");
        assert_eq!(json["client_record_id"], 7);
        assert_eq!(json["action"], "scan_qr");
        assert_eq!(json["scan_type"], "qr");
        assert_eq!(json["location"], "Main Gate");
        assert_eq!(json["offline_timestamp"], 1_792_393_500_000i64);
        assert_eq!(json["offline_sync"], true);
        assert_eq!(json["date"], "2026-10-19");
        assert_eq!(json["timestamp"], "2026-10-19T07:05:00Z");
        assert_eq!(json["dedup_key"], "42:5:2026-10-19");
    }

    #[test]
    fn test_batch_response_accepts_error_alias_and_numeric_ids() {
        let body = r#"{
            "success": true,
            "message": "Processed 1 attendance records with 1 errors",
            "total": 2, "success_count": 1, "error_count": 1,
            "results": [
                {"success": true, "student_id": 42, "student_name": "Ana", "status": "present"},
                {"success": false, "student_id": "unknown", "error": "Student not found: 9"}
            ]
        }"#;
        let parsed: BatchResponse = serde_json::from_str(body).expect("parse");
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].student_id.as_deref(), Some("42"));
        assert_eq!(parsed.results[1].error_message(), "Student not found: 9");
    }

    #[test]
    fn test_form_type_validation() {
        assert!(validate_form_type("excuse-letter").is_ok());
        assert!(validate_form_type("leave_request2").is_ok());
        assert!(validate_form_type("../admin").is_err());
        assert!(validate_form_type("").is_err());
    }
}
