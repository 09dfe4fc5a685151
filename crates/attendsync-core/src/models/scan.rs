use std::fmt;

use serde::{Deserialize, Serialize};

use super::lenient;

/// Scan location used when the operator does not pick one.
pub const DEFAULT_SCAN_LOCATION: &str = "Main Gate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Qr,
    Lrn,
    Manual,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Qr => "qr",
            ScanType::Lrn => "lrn",
            ScanType::Manual => "manual",
        }
    }

    /// Attendance action name understood by the reconciliation endpoint.
    pub fn action(&self) -> &'static str {
        match self {
            ScanType::Qr => "scan_qr",
            ScanType::Lrn => "scan_lrn",
            ScanType::Manual => "scan_manual",
        }
    }

    pub fn method_label(&self) -> &'static str {
        match self {
            ScanType::Qr => "QR Code",
            ScanType::Lrn => "LRN",
            ScanType::Manual => "Manual Entry",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_location() -> String {
    DEFAULT_SCAN_LOCATION.to_string()
}

/// Everything the operator entered at scan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanData {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub qr_data: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub lrn: Option<String>,
    #[serde(default = "default_location", alias = "location")]
    pub scan_location: String,
    #[serde(default, alias = "notes")]
    pub scan_notes: String,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_method: Option<String>,
}

impl Default for ScanData {
    fn default() -> Self {
        Self {
            subject_id: None,
            subject_name: None,
            student_id: None,
            student_name: None,
            qr_data: None,
            lrn: None,
            scan_location: default_location(),
            scan_notes: String::new(),
            teacher_id: None,
            teacher_name: None,
            scan_method: None,
        }
    }
}

impl ScanData {
    /// Best available student identifier: resolved id, then LRN, then raw QR payload.
    pub fn student_key(&self) -> Option<&str> {
        self.student_id
            .as_deref()
            .or(self.lrn.as_deref())
            .or(self.qr_data.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_student_key_preference() {
        let mut data = ScanData {
            qr_data: Some("raw".to_string()),
            ..ScanData::default()
        };
        assert_eq!(data.student_key(), Some("raw"));
        data.lrn = Some("123456789012".to_string());
        assert_eq!(data.student_key(), Some("123456789012"));
        data.student_id = Some("42".to_string());
        assert_eq!(data.student_key(), Some("42"));
    }

    #[test]
    fn test_scan_type_actions() {
        assert_eq!(ScanType::Qr.action(), "scan_qr");
        assert_eq!(ScanType::Lrn.action(), "scan_lrn");
        assert_eq!(ScanType::Manual.action(), "scan_manual");
        assert_eq!(serde_json::to_string(&ScanType::Lrn).expect("json"), "\"lrn\"");
    }
}
