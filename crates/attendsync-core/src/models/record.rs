//! Records held by the local store.
//!
//! Every syncable record shares the same [`SyncState`] fields, flattened
//! into the record body so that rows written by older clients (which kept
//! these fields at the top level) decode unchanged.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lenient;
use super::scan::{ScanData, ScanType};

/// Store-assigned record identifier. Never reused and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three syncable record stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoreKind {
    #[serde(rename = "login_attempts")]
    LoginAttempts,
    #[serde(rename = "attendance_records")]
    AttendanceRecords,
    #[serde(rename = "form_submissions")]
    FormSubmissions,
}

impl StoreKind {
    pub const ALL: [StoreKind; 3] = [
        StoreKind::LoginAttempts,
        StoreKind::AttendanceRecords,
        StoreKind::FormSubmissions,
    ];

    pub fn store_name(&self) -> &'static str {
        match self {
            StoreKind::LoginAttempts => "login_attempts",
            StoreKind::AttendanceRecords => "attendance_records",
            StoreKind::FormSubmissions => "form_submissions",
        }
    }

    pub fn from_store_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.store_name() == name)
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.store_name())
    }
}

/// UTC calendar date (`YYYY-MM-DD`) of an epoch-millisecond timestamp.
pub fn date_for_timestamp(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default, deserialize_with = "lenient::flag")]
    pub synced: bool,
    #[serde(default, deserialize_with = "lenient::datetime", skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::count")]
    pub sync_attempts: u32,
    #[serde(default, deserialize_with = "lenient::count")]
    pub retry_count: u32,
    /// Epoch milliseconds of the last failed attempt.
    #[serde(default, deserialize_with = "lenient::millis", skip_serializing_if = "Option::is_none")]
    pub last_retry: Option<i64>,
    /// Earliest epoch millisecond at which an automatic pass may retry.
    #[serde(default, deserialize_with = "lenient::millis", skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: RecordId,
    pub scan_type: ScanType,
    pub scan_data: ScanData,
    #[serde(deserialize_with = "lenient::required_millis")]
    pub timestamp: i64,
    #[serde(default)]
    pub date: String,
    /// Copy of the resolved student identifier, kept top-level for the `student_id` index.
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(flatten)]
    pub sync: SyncState,
    #[serde(default, deserialize_with = "lenient::datetime", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl AttendanceRecord {
    /// Capture date, derived from `timestamp` when the stored value is missing.
    pub fn capture_date(&self) -> String {
        if self.date.is_empty() {
            date_for_timestamp(self.timestamp)
        } else {
            self.date.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSubmission {
    pub id: RecordId,
    pub form_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(deserialize_with = "lenient::required_millis")]
    pub timestamp: i64,
    #[serde(flatten)]
    pub sync: SyncState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub id: RecordId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(deserialize_with = "lenient::required_millis")]
    pub timestamp: i64,
    #[serde(flatten)]
    pub sync: SyncState,
}

/// A decoded row from one of the syncable stores.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Attendance(AttendanceRecord),
    Form(FormSubmission),
    Login(LoginAttempt),
}

impl Record {
    pub fn from_value(kind: StoreKind, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            StoreKind::AttendanceRecords => Record::Attendance(serde_json::from_value(value)?),
            StoreKind::FormSubmissions => Record::Form(serde_json::from_value(value)?),
            StoreKind::LoginAttempts => Record::Login(serde_json::from_value(value)?),
        })
    }

    pub fn kind(&self) -> StoreKind {
        match self {
            Record::Attendance(_) => StoreKind::AttendanceRecords,
            Record::Form(_) => StoreKind::FormSubmissions,
            Record::Login(_) => StoreKind::LoginAttempts,
        }
    }

    pub fn id(&self) -> RecordId {
        match self {
            Record::Attendance(r) => r.id,
            Record::Form(r) => r.id,
            Record::Login(r) => r.id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Record::Attendance(r) => r.timestamp,
            Record::Form(r) => r.timestamp,
            Record::Login(r) => r.timestamp,
        }
    }

    pub fn sync(&self) -> &SyncState {
        match self {
            Record::Attendance(r) => &r.sync,
            Record::Form(r) => &r.sync,
            Record::Login(r) => &r.sync,
        }
    }

    pub fn as_attendance(&self) -> Option<&AttendanceRecord> {
        match self {
            Record::Attendance(r) => Some(r),
            _ => None,
        }
    }
}

/// A record about to be written; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub enum NewRecord {
    Attendance {
        scan_type: ScanType,
        scan_data: ScanData,
        timestamp: i64,
    },
    Form {
        form_type: String,
        data: Value,
        timestamp: i64,
    },
    Login {
        username: String,
        role: Option<String>,
        timestamp: i64,
    },
}

impl NewRecord {
    pub fn kind(&self) -> StoreKind {
        match self {
            NewRecord::Attendance { .. } => StoreKind::AttendanceRecords,
            NewRecord::Form { .. } => StoreKind::FormSubmissions,
            NewRecord::Login { .. } => StoreKind::LoginAttempts,
        }
    }

    /// Row body as persisted, without the `id` key.
    pub fn into_row(self) -> Value {
        let sync = SyncState::default();
        let mut row = match self {
            NewRecord::Attendance {
                scan_type,
                scan_data,
                timestamp,
            } => {
                let student_id = scan_data.student_key().map(str::to_string);
                serde_json::json!({
                    "scan_type": scan_type,
                    "scan_data": scan_data,
                    "timestamp": timestamp,
                    "date": date_for_timestamp(timestamp),
                    "student_id": student_id,
                    "created_at": Utc::now(),
                })
            }
            NewRecord::Form {
                form_type,
                data,
                timestamp,
            } => serde_json::json!({
                "form_type": form_type,
                "data": data,
                "timestamp": timestamp,
            }),
            NewRecord::Login {
                username,
                role,
                timestamp,
            } => serde_json::json!({
                "username": username,
                "role": role,
                "timestamp": timestamp,
            }),
        };
        if let (Value::Object(map), Ok(Value::Object(state))) = (&mut row, serde_json::to_value(&sync)) {
            map.extend(state);
        }
        row
    }
}

/// Unsynced record counts per store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub attendance: usize,
    pub forms: usize,
    pub logins: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.attendance + self.forms + self.logins
    }

    pub fn set(&mut self, kind: StoreKind, count: usize) {
        match kind {
            StoreKind::AttendanceRecords => self.attendance = count,
            StoreKind::FormSubmissions => self.forms = count,
            StoreKind::LoginAttempts => self.logins = count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_date_for_timestamp() {
        assert_eq!(date_for_timestamp(1_792_393_500_000), "2026-10-19");
        assert_eq!(date_for_timestamp(0), "1970-01-01");
    }

    #[test]
    fn test_new_attendance_row_defaults() {
        let row = NewRecord::Attendance {
            scan_type: ScanType::Manual,
            scan_data: ScanData {
                subject_id: Some("5".to_string()),
                student_id: Some("42".to_string()),
                ..ScanData::default()
            },
            timestamp: 1_792_393_500_000,
        }
        .into_row();

        assert_eq!(row["synced"], json!(false));
        assert_eq!(row["sync_attempts"], json!(0));
        assert_eq!(row["date"], json!("2026-10-19"));
        assert_eq!(row["student_id"], json!("42"));
        assert!(row.get("id").is_none());
    }

    #[test]
    fn test_legacy_attendance_row_decodes() {
        let row = json!({
            "id": 3,
            "scan_type": "qr",
            "scan_data": { "qr_data": "abc", "subject_id": 5 },
            "timestamp": 1_792_393_500_000i64,
            "synced": null
        });
        let record = Record::from_value(StoreKind::AttendanceRecords, row).expect("decode");
        let attendance = record.as_attendance().expect("attendance");
        assert_eq!(attendance.id, RecordId(3));
        assert!(!attendance.sync.synced);
        assert_eq!(attendance.sync.sync_attempts, 0);
        assert_eq!(attendance.capture_date(), "2026-10-19");
        assert_eq!(attendance.scan_data.subject_id.as_deref(), Some("5"));
        assert_eq!(attendance.scan_data.scan_location, "Main Gate");
    }

    #[test]
    fn test_store_kind_names_round_trip() {
        for kind in StoreKind::ALL {
            assert_eq!(StoreKind::from_store_name(kind.store_name()), Some(kind));
        }
        assert_eq!(StoreKind::from_store_name("sync_queue"), None);
    }

    #[test]
    fn test_pending_counts_total() {
        let mut counts = PendingCounts::default();
        counts.set(StoreKind::AttendanceRecords, 3);
        counts.set(StoreKind::FormSubmissions, 1);
        assert_eq!(counts.total(), 4);
    }
}
