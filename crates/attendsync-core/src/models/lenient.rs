//! Tolerant field decoders for rows written by older clients.
//!
//! Legacy rows carry `synced: null`, numeric ids stored as strings, ISO
//! timestamps where epoch milliseconds are expected, and so on. Each
//! decoder here accepts every shape seen in the wild and falls back to the
//! field's neutral value instead of failing the whole row.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Parse a JSON value as epoch milliseconds (numbers, numeric strings, RFC 3339).
pub fn value_to_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis())),
        _ => None,
    }
}

/// `true`, `1` and `"true"` are set; everything else (including null) is unset.
pub fn is_set(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s == "true" || s == "1",
        _ => false,
    }
}

/// Non-negative counter; missing, null or garbage counts as zero.
pub fn count_of(value: Option<&Value>) -> u32 {
    match value {
        Some(Value::Number(n)) => n.as_u64().map(|v| v.min(u32::MAX as u64) as u32).unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(is_set(value.as_ref()))
}

pub fn count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(count_of(value.as_ref()))
}

pub fn millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_millis))
}

pub fn required_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_millis(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", value)))
}

pub fn datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(value_to_millis)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
}

/// Identifiers arrive as strings or numbers depending on which form produced them.
pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Row {
        #[serde(default, deserialize_with = "flag")]
        synced: bool,
        #[serde(default, deserialize_with = "count")]
        retry_count: u32,
        #[serde(default, deserialize_with = "opt_string")]
        student_id: Option<String>,
        #[serde(default, deserialize_with = "millis")]
        last_retry: Option<i64>,
    }

    #[test]
    fn test_null_and_missing_fields_use_neutral_values() {
        let row: Row = serde_json::from_value(json!({ "synced": null })).expect("row");
        assert!(!row.synced);
        assert_eq!(row.retry_count, 0);
        assert_eq!(row.student_id, None);
        assert_eq!(row.last_retry, None);
    }

    #[test]
    fn test_legacy_shapes_are_accepted() {
        let row: Row = serde_json::from_value(json!({
            "synced": 1,
            "retry_count": "4",
            "student_id": 42,
            "last_retry": "2026-10-19T07:00:00Z"
        }))
        .expect("row");
        assert!(row.synced);
        assert_eq!(row.retry_count, 4);
        assert_eq!(row.student_id.as_deref(), Some("42"));
        assert_eq!(row.last_retry, Some(1_792_393_200_000));
    }

    #[test]
    fn test_blank_identifier_is_none() {
        let row: Row = serde_json::from_value(json!({ "student_id": "  " })).expect("row");
        assert_eq!(row.student_id, None);
    }
}
