// Local crates
use crate::buffer::buffer::BackpressureStrategy;
use crate::input::http::HttpInputConfig;
use crate::input::syslog::SyslogConfig;
use crate::parser::parser::ParserConfig;
use crate::pool::models::WorkerPoolConfig;
use crate::tailer::models::TailerConfig;
use crate::transform::transform::TransformConfig;

// External crates
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("environment variable ${{{0}}} referenced in configuration is not set")]
    MissingEnvVar(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_grace_period_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Bound on the graceful-shutdown window; overruns are aborted.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

fn default_buffer_capacity() -> usize {
    1024
}

fn default_strategy() -> BackpressureStrategy {
    BackpressureStrategy::Block
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
    #[serde(default = "default_strategy")]
    pub strategy: BackpressureStrategy,
    /// Producer deadline under the `block` strategy, unlimited when unset.
    pub send_timeout_ms: Option<u64>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            strategy: default_strategy(),
            send_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub tailer: Option<TailerConfig>,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub pool: WorkerPoolConfig,
    pub syslog: Option<SyslogConfig>,
    pub http: Option<HttpInputConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl Config {
    /// Load and parse the configuration file. `${NAME}` references are
    /// expanded from the environment before parsing; a reference to an
    /// unset variable is a hard error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let expanded = expand_env(&raw)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(tailer) = &self.tailer {
            if tailer.paths.is_empty() {
                return Err(ConfigError::Invalid(
                    "[tailer] requires at least one path".to_string(),
                ));
            }
            if tailer.checkpoint_dir.is_empty() {
                return Err(ConfigError::Invalid(
                    "[tailer] checkpoint_dir must not be empty".to_string(),
                ));
            }
        }
        if self.buffer.capacity == 0 {
            return Err(ConfigError::Invalid(
                "[buffer] capacity must be greater than zero".to_string(),
            ));
        }
        if self.pool.num_workers == 0 {
            return Err(ConfigError::Invalid(
                "[pool] num_workers must be greater than zero".to_string(),
            ));
        }
        if let Some(syslog) = &self.syslog {
            if syslog.tcp_addr.is_none() && syslog.udp_addr.is_none() {
                return Err(ConfigError::Invalid(
                    "[syslog] requires tcp_addr or udp_addr".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Replace every `${NAME}` with the variable's value at load time.
fn expand_env(raw: &str) -> Result<String, ConfigError> {
    lazy_static! {
        static ref REFERENCE: Regex =
            Regex::new(r"\$\{(?P<name>[A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern");
    }
    let mut missing = None;
    let expanded = REFERENCE.replace_all(raw, |caps: &regex::Captures<'_>| {
        let name = &caps["name"];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(expanded.into_owned()),
    }
}
