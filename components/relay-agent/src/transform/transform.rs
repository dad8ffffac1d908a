// Local crates
use crate::model::event::{FieldValue, LogEvent};

// External crates
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("field {0:?} not present")]
    MissingField(String),
    #[error("field {0:?} is not a string")]
    NotAString(String),
    #[error("pattern did not match field {0:?}")]
    NoMatch(String),
}

fn default_field_split() -> String {
    " ".to_string()
}

fn default_value_split() -> String {
    "=".to_string()
}

/// Declarative transform list entry, as written in configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransformConfig {
    /// Retain only the listed field keys.
    FilterInclude { keys: Vec<String> },
    /// Drop the listed field keys.
    FilterExclude { keys: Vec<String> },
    /// Rename keys per mapping; missing keys are skipped.
    Rename { mapping: BTreeMap<String, String> },
    /// Add or overwrite keys with literal values.
    Add {
        values: BTreeMap<String, serde_json::Value>,
    },
    /// Split a string field into `key<value_split>value` tokens separated by
    /// `field_split`, injecting each as a sub-field.
    ExtractKv {
        field: String,
        #[serde(default = "default_field_split")]
        field_split: String,
        #[serde(default = "default_value_split")]
        value_split: String,
        #[serde(default)]
        prefix: Option<String>,
    },
    /// Apply an extra regex with named captures to a string field.
    Patterns { field: String, pattern: String },
}

/// Compiled transform. Each one is a pure event-to-event step; failures
/// leave the event untouched.
#[derive(Debug)]
pub enum Transform {
    FilterInclude {
        keys: Vec<String>,
    },
    FilterExclude {
        keys: Vec<String>,
    },
    Rename {
        mapping: BTreeMap<String, String>,
    },
    Add {
        values: BTreeMap<String, FieldValue>,
    },
    ExtractKv {
        field: String,
        field_split: String,
        value_split: String,
        prefix: Option<String>,
    },
    Patterns {
        field: String,
        regex: Regex,
    },
}

impl Transform {
    pub fn from_config(config: &TransformConfig) -> Result<Self, TransformError> {
        Ok(match config {
            TransformConfig::FilterInclude { keys } => Transform::FilterInclude { keys: keys.clone() },
            TransformConfig::FilterExclude { keys } => Transform::FilterExclude { keys: keys.clone() },
            TransformConfig::Rename { mapping } => Transform::Rename {
                mapping: mapping.clone(),
            },
            TransformConfig::Add { values } => Transform::Add {
                values: values
                    .iter()
                    .map(|(k, v)| (k.clone(), FieldValue::from_json(v.clone())))
                    .collect(),
            },
            TransformConfig::ExtractKv {
                field,
                field_split,
                value_split,
                prefix,
            } => Transform::ExtractKv {
                field: field.clone(),
                field_split: field_split.clone(),
                value_split: value_split.clone(),
                prefix: prefix.clone(),
            },
            TransformConfig::Patterns { field, pattern } => Transform::Patterns {
                field: field.clone(),
                regex: Regex::new(pattern)?,
            },
        })
    }

    /// Apply in place. Every variant validates before mutating, so an error
    /// means the event is exactly as it was.
    pub fn apply(&self, event: &mut LogEvent) -> Result<(), TransformError> {
        match self {
            Transform::FilterInclude { keys } => {
                event.fields.retain(|key, _| keys.contains(key));
                Ok(())
            }
            Transform::FilterExclude { keys } => {
                event.fields.retain(|key, _| !keys.contains(key));
                Ok(())
            }
            Transform::Rename { mapping } => {
                for (from, to) in mapping {
                    if let Some(value) = event.fields.remove(from) {
                        event.fields.insert(to.clone(), value);
                    }
                }
                Ok(())
            }
            Transform::Add { values } => {
                for (key, value) in values {
                    event.fields.insert(key.clone(), value.clone());
                }
                Ok(())
            }
            Transform::ExtractKv {
                field,
                field_split,
                value_split,
                prefix,
            } => {
                let text = event
                    .fields
                    .get(field)
                    .ok_or_else(|| TransformError::MissingField(field.clone()))?
                    .as_str()
                    .ok_or_else(|| TransformError::NotAString(field.clone()))?
                    .to_string();
                for token in text.split(field_split.as_str()) {
                    let Some((key, value)) = token.split_once(value_split.as_str()) else {
                        continue;
                    };
                    if key.is_empty() {
                        continue;
                    }
                    let key = match prefix {
                        Some(prefix) => format!("{prefix}{key}"),
                        None => key.to_string(),
                    };
                    event.fields.insert(key, value.into());
                }
                Ok(())
            }
            Transform::Patterns { field, regex } => {
                let text = event
                    .fields
                    .get(field)
                    .ok_or_else(|| TransformError::MissingField(field.clone()))?
                    .as_str()
                    .ok_or_else(|| TransformError::NotAString(field.clone()))?
                    .to_string();
                let caps = regex
                    .captures(&text)
                    .ok_or_else(|| TransformError::NoMatch(field.clone()))?;
                for name in regex.capture_names().flatten() {
                    if let Some(value) = caps.name(name) {
                        event.fields.insert(name.to_string(), value.as_str().into());
                    }
                }
                Ok(())
            }
        }
    }
}

/// Ordered transform chain. A failing step is logged and skipped; the event
/// continues through the rest of the chain unchanged by the failure.
#[derive(Debug, Default)]
pub struct TransformPipeline {
    transforms: Vec<Transform>,
}

impl TransformPipeline {
    pub fn from_config(configs: &[TransformConfig]) -> Result<Self, TransformError> {
        Ok(Self {
            transforms: configs
                .iter()
                .map(Transform::from_config)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn apply(&self, event: &mut LogEvent) {
        for (index, transform) in self.transforms.iter().enumerate() {
            if let Err(e) = transform.apply(event) {
                tracing::debug!(
                    transform_index = index,
                    source = %event.source,
                    error = %e,
                    "Transform failed, continuing with event as-is"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with(fields: &[(&str, &str)]) -> LogEvent {
        let mut event = LogEvent::from_line("test", "line\n");
        for (key, value) in fields {
            event.fields.insert(key.to_string(), (*value).into());
        }
        event
    }

    fn compile(config: TransformConfig) -> Transform {
        Transform::from_config(&config).unwrap()
    }

    #[test]
    fn filter_include_retains_listed_keys() {
        let mut event = event_with(&[("keep", "a"), ("drop", "b")]);
        compile(TransformConfig::FilterInclude {
            keys: vec!["keep".to_string()],
        })
        .apply(&mut event)
        .unwrap();
        assert!(event.fields.contains_key("keep"));
        assert!(!event.fields.contains_key("drop"));
    }

    #[test]
    fn filter_exclude_drops_listed_keys() {
        let mut event = event_with(&[("keep", "a"), ("drop", "b")]);
        compile(TransformConfig::FilterExclude {
            keys: vec!["drop".to_string()],
        })
        .apply(&mut event)
        .unwrap();
        assert!(event.fields.contains_key("keep"));
        assert!(!event.fields.contains_key("drop"));
    }

    #[test]
    fn rename_moves_values() {
        let mut event = event_with(&[("old", "v")]);
        let mut mapping = BTreeMap::new();
        mapping.insert("old".to_string(), "new".to_string());
        compile(TransformConfig::Rename { mapping })
            .apply(&mut event)
            .unwrap();
        assert_eq!(event.fields.get("new"), Some(&FieldValue::String("v".into())));
        assert!(!event.fields.contains_key("old"));
    }

    #[test]
    fn empty_rename_is_identity() {
        let mut event = event_with(&[("a", "1"), ("b", "2")]);
        let before = event.clone();
        compile(TransformConfig::Rename {
            mapping: BTreeMap::new(),
        })
        .apply(&mut event)
        .unwrap();
        assert_eq!(event.fields, before.fields);
        assert_eq!(event.message, before.message);
    }

    #[test]
    fn add_overwrites_existing() {
        let mut event = event_with(&[("env", "dev")]);
        let mut values = BTreeMap::new();
        values.insert("env".to_string(), serde_json::json!("prod"));
        values.insert("dc".to_string(), serde_json::json!(3));
        compile(TransformConfig::Add { values })
            .apply(&mut event)
            .unwrap();
        assert_eq!(event.fields.get("env"), Some(&FieldValue::String("prod".into())));
        assert_eq!(event.fields.get("dc"), Some(&FieldValue::Integer(3)));
    }

    #[test]
    fn extract_kv_injects_sub_fields() {
        let mut event = event_with(&[("ctx", "user=alice region=eu retries=2")]);
        compile(TransformConfig::ExtractKv {
            field: "ctx".to_string(),
            field_split: " ".to_string(),
            value_split: "=".to_string(),
            prefix: Some("ctx_".to_string()),
        })
        .apply(&mut event)
        .unwrap();
        assert_eq!(
            event.fields.get("ctx_user"),
            Some(&FieldValue::String("alice".into()))
        );
        assert_eq!(
            event.fields.get("ctx_region"),
            Some(&FieldValue::String("eu".into()))
        );
        assert_eq!(
            event.fields.get("ctx_retries"),
            Some(&FieldValue::String("2".into()))
        );
    }

    #[test]
    fn patterns_applies_named_captures_to_field() {
        let mut event = event_with(&[("request", "GET /api/v1/users 200")]);
        compile(TransformConfig::Patterns {
            field: "request".to_string(),
            pattern: r"^(?P<verb>\w+) (?P<path>\S+) (?P<status>\d+)$".to_string(),
        })
        .apply(&mut event)
        .unwrap();
        assert_eq!(event.fields.get("verb"), Some(&FieldValue::String("GET".into())));
        assert_eq!(event.fields.get("status"), Some(&FieldValue::String("200".into())));
    }

    #[test]
    fn failing_transform_leaves_event_untouched() {
        let mut event = event_with(&[("a", "1")]);
        let before = event.clone();
        let result = compile(TransformConfig::ExtractKv {
            field: "missing".to_string(),
            field_split: " ".to_string(),
            value_split: "=".to_string(),
            prefix: None,
        })
        .apply(&mut event);
        assert!(result.is_err());
        assert_eq!(event.fields, before.fields);
    }

    #[test]
    fn pipeline_continues_past_failures() {
        let pipeline = TransformPipeline::from_config(&[
            TransformConfig::Patterns {
                field: "nope".to_string(),
                pattern: r"(?P<x>\d+)".to_string(),
            },
            TransformConfig::Add {
                values: {
                    let mut m = BTreeMap::new();
                    m.insert("after".to_string(), serde_json::json!("yes"));
                    m
                },
            },
        ])
        .unwrap();
        let mut event = event_with(&[]);
        pipeline.apply(&mut event);
        assert_eq!(event.fields.get("after"), Some(&FieldValue::String("yes".into())));
    }
}
