use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lenient;

/// A key/value entry in the `cache_data` store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDataEntry {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(deserialize_with = "lenient::required_millis")]
    pub timestamp: i64,
    #[serde(default, deserialize_with = "lenient::millis", skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

impl CacheDataEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires.map(|e| e <= now_ms).unwrap_or(false)
    }

    /// Essential entries (user, auth and session state) survive size trimming.
    pub fn is_essential(&self, essential_prefixes: &[String]) -> bool {
        essential_prefixes.iter().any(|p| self.key.starts_with(p.as_str()))
    }

    /// Serialized size of the entry, used for quota accounting.
    pub fn approx_bytes(&self) -> u64 {
        serde_json::to_vec(self).map(|v| v.len() as u64).unwrap_or(0)
    }
}
