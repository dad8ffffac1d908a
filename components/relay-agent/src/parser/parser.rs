// Local crates
use crate::model::event::{FieldValue, LogEvent, normalize_level};
use crate::parser::grok::{self, GrokError};
use crate::parser::multiline::MultilineConfig;

// External crates
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json line is not an object")]
    JsonNotObject,
    #[error("line does not match pattern")]
    NoMatch,
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Grok(#[from] GrokError),
    #[error("parser kind {0:?} requires a pattern")]
    MissingPattern(ParserKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    /// Raw lines pass through as the event message.
    Plain,
    /// One JSON object per line.
    Json,
    /// A single regex with named capture groups.
    Regex,
    /// A grok expression or library alias expanded to a regex.
    Grok,
}

fn default_time_field() -> String {
    "timestamp".to_string()
}

fn default_level_field() -> String {
    "level".to_string()
}

fn default_message_field() -> String {
    "message".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    pub kind: ParserKind,
    /// Regex with named groups (`kind = "regex"`).
    pub pattern: Option<String>,
    /// Grok expression or alias (`kind = "grok"`).
    pub grok_pattern: Option<String>,
    #[serde(default = "default_time_field")]
    pub time_field: String,
    #[serde(default = "default_level_field")]
    pub level_field: String,
    #[serde(default = "default_message_field")]
    pub message_field: String,
    pub multiline: Option<MultilineConfig>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            kind: ParserKind::Plain,
            pattern: None,
            grok_pattern: None,
            time_field: default_time_field(),
            level_field: default_level_field(),
            message_field: default_message_field(),
            multiline: None,
        }
    }
}

/// Compiled parser. Construction validates patterns so malformed
/// configuration fails at startup, not per-event.
#[derive(Debug)]
pub enum LogParser {
    Plain,
    Json {
        time_field: String,
        level_field: String,
        message_field: String,
    },
    Pattern {
        regex: Regex,
        time_field: String,
        level_field: String,
        message_field: String,
    },
}

impl LogParser {
    pub fn from_config(config: &ParserConfig) -> Result<Self, ParseError> {
        match config.kind {
            ParserKind::Plain => Ok(LogParser::Plain),
            ParserKind::Json => Ok(LogParser::Json {
                time_field: config.time_field.clone(),
                level_field: config.level_field.clone(),
                message_field: config.message_field.clone(),
            }),
            ParserKind::Regex => {
                let pattern = config
                    .pattern
                    .as_deref()
                    .ok_or(ParseError::MissingPattern(ParserKind::Regex))?;
                Ok(LogParser::Pattern {
                    regex: Regex::new(pattern)?,
                    time_field: config.time_field.clone(),
                    level_field: config.level_field.clone(),
                    message_field: config.message_field.clone(),
                })
            }
            ParserKind::Grok => {
                let pattern = config
                    .grok_pattern
                    .as_deref()
                    .ok_or(ParseError::MissingPattern(ParserKind::Grok))?;
                Ok(LogParser::Pattern {
                    regex: grok::compile(pattern)?,
                    time_field: config.time_field.clone(),
                    level_field: config.level_field.clone(),
                    message_field: config.message_field.clone(),
                })
            }
        }
    }

    /// Parse one logical record. The raw line is preserved on the event;
    /// pattern matching runs against the line without its trailing newline.
    pub fn parse(&self, source: &str, line: &str) -> Result<LogEvent, ParseError> {
        match self {
            LogParser::Plain => Ok(LogEvent::from_line(source, line)),
            LogParser::Json {
                time_field,
                level_field,
                message_field,
            } => {
                let value: serde_json::Value = serde_json::from_str(line.trim_end())?;
                let serde_json::Value::Object(map) = value else {
                    return Err(ParseError::JsonNotObject);
                };
                let mut event = LogEvent::from_line(source, line);
                event.message = String::new();
                for (key, value) in map {
                    if key == *message_field {
                        event.message = match value {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                    } else if key == *level_field {
                        if let serde_json::Value::String(s) = &value {
                            event.level = Some(normalize_level(s));
                        }
                    } else if key == *time_field {
                        match parse_event_time_json(&value) {
                            Some(ts) => event.timestamp = ts,
                            // Unparseable time stays visible as a field.
                            None => {
                                event
                                    .fields
                                    .insert(key, FieldValue::from_json(value));
                            }
                        }
                    } else {
                        event.fields.insert(key, FieldValue::from_json(value));
                    }
                }
                Ok(event)
            }
            LogParser::Pattern {
                regex,
                time_field,
                level_field,
                message_field,
            } => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                let caps = regex.captures(trimmed).ok_or(ParseError::NoMatch)?;
                let mut event = LogEvent::from_line(source, line);
                for name in regex.capture_names().flatten() {
                    let Some(value) = caps.name(name) else {
                        continue;
                    };
                    let value = value.as_str();
                    if name == message_field {
                        event.message = value.to_string();
                    } else if name == level_field {
                        event.level = Some(normalize_level(value));
                    } else if name == time_field {
                        match parse_event_time(value) {
                            Some(ts) => event.timestamp = ts,
                            None => {
                                event.fields.insert(name.to_string(), value.into());
                            }
                        }
                    } else {
                        event.fields.insert(name.to_string(), value.into());
                    }
                }
                Ok(event)
            }
        }
    }

    /// Parse, or degrade to a raw fallback event flagged `parse_failed` so
    /// the caller can decide whether to forward or drop it.
    pub fn parse_or_fallback(&self, source: &str, line: &str) -> LogEvent {
        match self.parse(source, line) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(source, error = %e, "Parse failed, emitting raw fallback event");
                let mut event = LogEvent::from_line(source, line);
                event.parse_failed = true;
                event
            }
        }
    }
}

fn parse_event_time_json(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => parse_event_time(s),
        // Numeric timestamps: seconds or milliseconds since the epoch.
        serde_json::Value::Number(n) => {
            let n = n.as_i64()?;
            if n >= 100_000_000_000 {
                Utc.timestamp_millis_opt(n).single()
            } else {
                Utc.timestamp_opt(n, 0).single()
            }
        }
        _ => None,
    }
}

/// Best-effort wall-clock parsing for the formats the built-in patterns
/// extract. Syslog timestamps carry no year; the current one is assumed.
fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Utc.from_local_datetime(&naive).single();
        }
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%d/%b/%Y:%H:%M:%S %z") {
        return Some(ts.with_timezone(&Utc));
    }
    // "Jan 15 10:30:00" (syslog, single-space day)
    let with_year = format!("{} {}", Utc::now().year(), raw.split_whitespace().collect::<Vec<_>>().join(" "));
    if let Ok(naive) = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M:%S") {
        return Utc.from_local_datetime(&naive).single();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: ParserKind) -> ParserConfig {
        ParserConfig {
            kind,
            ..ParserConfig::default()
        }
    }

    #[test]
    fn plain_keeps_line_as_message() {
        let parser = LogParser::from_config(&config(ParserKind::Plain)).unwrap();
        let event = parser.parse("f", "hello world\n").unwrap();
        assert_eq!(event.message, "hello world\n");
        assert!(event.fields.is_empty());
    }

    #[test]
    fn json_extracts_configured_fields() {
        let parser = LogParser::from_config(&config(ParserKind::Json)).unwrap();
        let event = parser
            .parse(
                "f",
                r#"{"timestamp":"2026-01-15T10:30:00Z","level":"WARNING","message":"disk low","disk":"sda1","free_mb":512}"#,
            )
            .unwrap();
        assert_eq!(event.message, "disk low");
        assert_eq!(event.level.as_deref(), Some("warn"));
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2026, 1, 15, 10, 30, 0).unwrap()
        );
        assert_eq!(event.fields.get("disk"), Some(&FieldValue::String("sda1".into())));
        assert_eq!(event.fields.get("free_mb"), Some(&FieldValue::Integer(512)));
        assert!(!event.fields.contains_key("message"));
    }

    #[test]
    fn json_decode_failure_falls_back_with_flag() {
        let parser = LogParser::from_config(&config(ParserKind::Json)).unwrap();
        let event = parser.parse_or_fallback("f", "not json at all\n");
        assert!(event.parse_failed);
        assert_eq!(event.message, "not json at all\n");
        assert!(event.fields.is_empty());
        assert_eq!(event.raw().as_ref(), b"not json at all\n");
    }

    #[test]
    fn regex_named_groups_become_fields() {
        let mut cfg = config(ParserKind::Regex);
        cfg.pattern = Some(r"^(?P<level>\w+) (?P<component>\S+) (?P<message>.*)$".to_string());
        let parser = LogParser::from_config(&cfg).unwrap();
        let event = parser.parse("f", "ERROR scheduler tick missed\n").unwrap();
        assert_eq!(event.level.as_deref(), Some("error"));
        assert_eq!(event.message, "tick missed");
        assert_eq!(
            event.fields.get("component"),
            Some(&FieldValue::String("scheduler".into()))
        );
    }

    #[test]
    fn grok_syslog_scenario() {
        let mut cfg = config(ParserKind::Grok);
        cfg.grok_pattern = Some("syslog".to_string());
        let parser = LogParser::from_config(&cfg).unwrap();
        let event = parser
            .parse(
                "f",
                "Jan 15 10:30:00 server1 myapp[1234]: Application started successfully",
            )
            .unwrap();
        assert_eq!(event.message, "Application started successfully");
        assert_eq!(
            event.fields.get("program"),
            Some(&FieldValue::String("myapp".into()))
        );
        assert_eq!(event.timestamp.month(), 1);
        assert_eq!(event.timestamp.day(), 15);
    }

    #[test]
    fn grok_unknown_pattern_fails_construction() {
        let mut cfg = config(ParserKind::Grok);
        cfg.grok_pattern = Some("%{BOGUS:x}".to_string());
        assert!(LogParser::from_config(&cfg).is_err());
    }

    #[test]
    fn regex_without_pattern_fails_construction() {
        assert!(LogParser::from_config(&config(ParserKind::Regex)).is_err());
    }

    #[test]
    fn unparseable_time_is_kept_as_field() {
        let parser = LogParser::from_config(&config(ParserKind::Json)).unwrap();
        let event = parser
            .parse("f", r#"{"timestamp":"soonish","message":"m"}"#)
            .unwrap();
        assert_eq!(
            event.fields.get("timestamp"),
            Some(&FieldValue::String("soonish".into()))
        );
    }

    #[test]
    fn numeric_epoch_timestamps_accepted() {
        let parser = LogParser::from_config(&config(ParserKind::Json)).unwrap();
        let event = parser
            .parse("f", r#"{"timestamp":1750000000,"message":"m"}"#)
            .unwrap();
        assert_eq!(event.timestamp.timestamp(), 1_750_000_000);
    }
}
