// External crates
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Canonical severity names. Extracted levels are lowercased and folded
/// onto this set; values outside it pass through untouched.
const CANONICAL_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "fatal"];

/// Dynamically-typed field value carried in [`LogEvent::fields`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Map(BTreeMap<String, FieldValue>),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Convert a JSON value into a field value. JSON `null` becomes an
    /// empty string so fields never hold an absent marker.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::String(String::new()),
            serde_json::Value::Bool(b) => FieldValue::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Integer(i)
                } else {
                    FieldValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => FieldValue::String(s),
            serde_json::Value::Array(items) => {
                FieldValue::List(items.into_iter().map(FieldValue::from_json).collect())
            }
            serde_json::Value::Object(map) => FieldValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, FieldValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::String(s) => serde_json::Value::String(s.clone()),
            FieldValue::Integer(i) => serde_json::Value::from(*i),
            FieldValue::Float(f) => serde_json::Value::from(*f),
            FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
            FieldValue::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            FieldValue::List(l) => {
                serde_json::Value::Array(l.iter().map(FieldValue::to_json).collect())
            }
        }
    }

    /// String representation used by transforms that split field contents.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

/// The in-flight record flowing from inputs through the parser, transform
/// pipeline and buffer to the worker pool.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Reception instant, replaced by the parsed time when available.
    pub timestamp: DateTime<Utc>,
    /// Normalized severity, if one was extracted.
    pub level: Option<String>,
    /// Human-readable payload after parsing.
    pub message: String,
    /// Origin identifier: file path, remote address or input name.
    pub source: String,
    /// Parsed and transform-added fields.
    pub fields: BTreeMap<String, FieldValue>,
    /// Whether the configured parser failed and this event is a raw fallback.
    pub parse_failed: bool,
    raw: Bytes,
}

impl LogEvent {
    /// Build an event from a raw line. `message` carries the line as-is;
    /// `raw` keeps the original bytes for diagnostic fallback.
    pub fn from_line(source: &str, line: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            level: None,
            message: line.to_string(),
            source: source.to_string(),
            fields: BTreeMap::new(),
            parse_failed: false,
            raw: Bytes::copy_from_slice(line.as_bytes()),
        }
    }

    /// The original byte sequence prior to parsing. Immutable after
    /// construction.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "timestamp".to_string(),
            serde_json::Value::String(self.timestamp.to_rfc3339()),
        );
        if let Some(level) = &self.level {
            map.insert(
                "level".to_string(),
                serde_json::Value::String(level.clone()),
            );
        }
        map.insert(
            "message".to_string(),
            serde_json::Value::String(self.message.clone()),
        );
        map.insert(
            "source".to_string(),
            serde_json::Value::String(self.source.clone()),
        );
        if !self.fields.is_empty() {
            map.insert(
                "fields".to_string(),
                serde_json::Value::Object(
                    self.fields
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect(),
                ),
            );
        }
        if self.parse_failed {
            map.insert("parse_failed".to_string(), serde_json::Value::Bool(true));
        }
        serde_json::Value::Object(map)
    }
}

/// Lowercase a raw severity string and fold the common aliases onto the
/// canonical set. Unrecognized values are returned lowercased but otherwise
/// untouched.
pub fn normalize_level(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let folded = match lowered.as_str() {
        "warning" => "warn",
        "err" => "error",
        "crit" | "critical" | "severe" | "panic" | "emerg" | "emergency" | "alert" => "fatal",
        "informational" | "notice" => "info",
        "dbg" | "fine" => "debug",
        other => other,
    };
    if CANONICAL_LEVELS.contains(&folded) {
        folded.to_string()
    } else {
        lowered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_aliases_fold_onto_canonical_set() {
        assert_eq!(normalize_level("WARNING"), "warn");
        assert_eq!(normalize_level("Err"), "error");
        assert_eq!(normalize_level("CRITICAL"), "fatal");
        assert_eq!(normalize_level("INFO"), "info");
        assert_eq!(normalize_level("trace"), "trace");
    }

    #[test]
    fn unknown_levels_pass_through_lowercased() {
        assert_eq!(normalize_level("VERBOSE"), "verbose");
    }

    #[test]
    fn field_value_json_round_trip() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"a": 1, "b": "two", "c": [true, 2.5], "d": {"nested": "yes"}}"#,
        )
        .unwrap();
        let value = FieldValue::from_json(json.clone());
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn raw_bytes_preserved() {
        let event = LogEvent::from_line("test", "hello\n");
        assert_eq!(event.raw().as_ref(), b"hello\n");
        assert_eq!(event.message, "hello\n");
    }
}
