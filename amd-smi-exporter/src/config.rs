//! Configuration for the AMD SMI exporter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::mapping::Family;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// amd-smi invocation settings.
    #[serde(default)]
    pub smi: SmiConfig,

    /// HTTP endpoint settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Metric family filtering.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How amd-smi is invoked on each collection cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmiConfig {
    /// Executable to run (default: "amd-smi").
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments (default: ["metric", "--json"]).
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Extra environment variables for the child process.
    #[serde(default = "default_env")]
    pub env: HashMap<String, String>,

    /// Maximum run time before the cycle is abandoned (seconds).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_command() -> String {
    "amd-smi".to_string()
}

fn default_args() -> Vec<String> {
    vec!["metric".to_string(), "--json".to_string()]
}

fn default_env() -> HashMap<String, String> {
    // amd-smi truncates wide output to the terminal width otherwise
    HashMap::from([("COLUMNS".to_string(), "1000".to_string())])
}

fn default_timeout() -> u64 {
    10
}

impl Default for SmiConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            env: default_env(),
            timeout_secs: default_timeout(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Address for GPU metrics (default: "0.0.0.0:9360").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Address for the exporter's own metrics (default: "0.0.0.0:9361").
    /// `null` disables the runtime listener.
    #[serde(default = "default_runtime_listen")]
    pub runtime_listen: Option<String>,

    /// Path for metrics endpoints (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: "amd_gpu").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_listen() -> String {
    "0.0.0.0:9360".to_string()
}

fn default_runtime_listen() -> Option<String> {
    Some("0.0.0.0:9361".to_string())
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "amd_gpu".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            runtime_listen: default_runtime_listen(),
            path: default_path(),
            prefix: default_prefix(),
        }
    }
}

/// Metric family filtering configuration.
///
/// Patterns are globs matched against family keys such as `usage`,
/// `memory_bytes` or `ecc_errors`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Only export these families (empty = all).
    #[serde(default)]
    pub include_families: Vec<String>,

    /// Never export these families.
    #[serde(default)]
    pub exclude_families: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smi.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "smi.command must not be empty".to_string(),
            ));
        }

        if self.smi.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        let listeners = std::iter::once(&self.web.listen).chain(&self.web.runtime_listen);
        for addr in listeners {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "Invalid listen address: {}",
                    addr
                )));
            }
        }

        if self.web.runtime_listen.as_ref() == Some(&self.web.listen) {
            return Err(ConfigError::Validation(
                "runtime_listen must differ from listen".to_string(),
            ));
        }

        if !self.web.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if matches!(self.web.path.as_str(), "/" | "/health" | "/ready") {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} is reserved",
                self.web.path
            )));
        }

        let patterns = self
            .filters
            .include_families
            .iter()
            .chain(&self.filters.exclude_families);
        for pattern in patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(ConfigError::Validation(format!(
                    "Invalid family pattern '{}': {}",
                    pattern, e
                )));
            }
        }

        Ok(())
    }
}

/// Compiled family filter.
#[derive(Debug, Clone, Default)]
pub struct FamilyFilter {
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
}

impl FamilyFilter {
    /// Compile a filter from configuration. Invalid patterns are ignored.
    pub fn new(config: &FilterConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<glob::Pattern> {
            patterns
                .iter()
                .filter_map(|p| glob::Pattern::new(p).ok())
                .collect()
        };

        Self {
            include: compile(&config.include_families),
            exclude: compile(&config.exclude_families),
        }
    }

    /// Check if a family should be exported.
    pub fn includes(&self, family: Family) -> bool {
        let key = family.key();

        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(key)) {
            return false;
        }

        !self.exclude.iter().any(|p| p.matches(key))
    }
}
