//! Query-time predicate shared by every vector search and by the chunk
//! post-filter: a metadata clause (equality / any-of) plus an optional
//! `[start_time, end_time]` window on `updated_at`. Metadata may be stored
//! either as a JSON object or as a JSON-encoded string; both shapes match.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub metadata: Option<Map<String, Value>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl VectorFilter {
    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.start_time.is_none() && self.end_time.is_none()
    }

    /// Drop the metadata clause but keep the time window. The entity- and
    /// relationship-level searches use this: their vector rows inherit
    /// metadata from a single source chunk, so metadata is applied to the
    /// chunks afterwards instead.
    pub fn time_only(&self) -> VectorFilter {
        VectorFilter {
            metadata: None,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    pub fn matches(&self, metadata: &Value, updated_at: Option<DateTime<Utc>>) -> bool {
        if let Some(clause) = &self.metadata {
            if !metadata_matches(clause, metadata) {
                return false;
            }
        }
        if self.start_time.is_some() || self.end_time.is_some() {
            let Some(at) = updated_at else { return false };
            if let Some(start) = self.start_time {
                if at < start {
                    return false;
                }
            }
            if let Some(end) = self.end_time {
                if at > end {
                    return false;
                }
            }
        }
        true
    }
}

/// Check every clause key against the stored metadata. A list value means
/// any-of membership; a scalar means equality. Numbers compare as numbers,
/// everything else by string.
pub fn metadata_matches(clause: &Map<String, Value>, stored: &Value) -> bool {
    let stored = normalize_metadata(stored);
    let Some(obj) = stored.as_object() else {
        return clause.is_empty();
    };
    clause.iter().all(|(key, expected)| {
        let Some(actual) = obj.get(key) else {
            return false;
        };
        match expected {
            Value::Array(options) => options.iter().any(|opt| scalar_eq(opt, actual)),
            other => scalar_eq(other, actual),
        }
    })
}

/// Metadata rows written through a string-typed column come back as a
/// JSON-encoded string; decode those so both physical shapes match.
pub fn normalize_metadata(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new())),
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    }
}

fn scalar_eq(expected: &Value, actual: &Value) -> bool {
    match (expected.as_f64(), actual.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => value_as_string(expected) == value_as_string(actual),
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn clause(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_scalar_equality() {
        let filter = clause(json!({"region": "APAC"}));
        assert!(metadata_matches(&filter, &json!({"region": "APAC", "x": 1})));
        assert!(!metadata_matches(&filter, &json!({"region": "EMEA"})));
        assert!(!metadata_matches(&filter, &json!({})));
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        let filter = clause(json!({"priority": 1}));
        assert!(metadata_matches(&filter, &json!({"priority": 1})));
        assert!(metadata_matches(&filter, &json!({"priority": 1.0})));
        assert!(!metadata_matches(&filter, &json!({"priority": 2})));
    }

    #[test]
    fn test_list_means_any_of() {
        let filter = clause(json!({"text_field": ["title", "summary"]}));
        assert!(metadata_matches(&filter, &json!({"text_field": "summary"})));
        assert!(!metadata_matches(&filter, &json!({"text_field": "body"})));
    }

    #[test]
    fn test_json_encoded_string_metadata_matches() {
        let filter = clause(json!({"region": "APAC"}));
        let stored = Value::String(r#"{"region":"APAC"}"#.to_string());
        assert!(metadata_matches(&filter, &stored));
    }

    #[test]
    fn test_time_window() {
        let at = |s: u32| Utc.with_ymd_and_hms(2025, 10, s, 0, 0, 0).unwrap();
        let filter = VectorFilter {
            metadata: None,
            start_time: Some(at(2)),
            end_time: Some(at(4)),
        };
        assert!(filter.matches(&json!({}), Some(at(3))));
        assert!(!filter.matches(&json!({}), Some(at(1))));
        assert!(!filter.matches(&json!({}), Some(at(5))));
        assert!(!filter.matches(&json!({}), None));
    }

    #[test]
    fn test_time_only_drops_metadata_clause() {
        let filter = VectorFilter {
            metadata: Some(clause(json!({"region": "APAC"}))),
            start_time: None,
            end_time: None,
        };
        assert!(filter.time_only().matches(&json!({"region": "EMEA"}), None));
    }
}
