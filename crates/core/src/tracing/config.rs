//! Configuration for logging and telemetry
//!
//! This module provides configuration types for the log sinks and for the
//! optional OpenTelemetry span export.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::CoreError;

/// Output encoding of log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Standard,
}

impl FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "standard" | "text" => Ok(Self::Standard),
            other => Err(CoreError::invalid_config(format!(
                "unknown log format '{other}', expected json or standard"
            ))),
        }
    }
}

/// Log sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level filter (e.g., "info", "debug"), `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
    /// Optional file sink next to the console
    pub file: Option<LogFileConfig>,
    /// Pretty-print JSON with this indentation
    pub json_indent: Option<usize>,
    pub include_timestamp: bool,
    pub include_level: bool,
    pub include_caller: bool,
    /// Color the standard format (terminal output in development only)
    pub use_colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            file: None,
            json_indent: None,
            include_timestamp: true,
            include_level: true,
            include_caller: true,
            use_colors: true,
        }
    }
}

/// File-based logging configuration
///
/// Logs are written with size-based rotation. When the current file exceeds
/// max_file_size_mb it is rotated and older files are kept up to max_files
/// total files. Accepts either this table or a plain path such as
/// `logs/roster.log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogFileConfig {
    /// Directory where log files should be written
    pub directory: PathBuf,
    /// Prefix for log file names (e.g., "roster" creates "roster.log")
    pub file_prefix: String,
    /// Maximum size in MB before rotating to a new file
    pub max_file_size_mb: u64,
    /// Maximum number of rotated log files to keep
    pub max_files: usize,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_prefix: "roster".to_string(),
            max_file_size_mb: 10,
            max_files: 10,
        }
    }
}

impl LogFileConfig {
    /// Sink writing to `path`, rotated with the default limits
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let defaults = Self::default();
        Self {
            directory: path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
            file_prefix: path
                .file_stem()
                .and_then(|s| s.to_str())
                .map_or(defaults.file_prefix.clone(), str::to_string),
            ..defaults
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LogFileRepr {
    Path(PathBuf),
    Table {
        #[serde(default)]
        directory: Option<PathBuf>,
        #[serde(default)]
        file_prefix: Option<String>,
        #[serde(default)]
        max_file_size_mb: Option<u64>,
        #[serde(default)]
        max_files: Option<usize>,
    },
}

impl<'de> Deserialize<'de> for LogFileConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let defaults = Self::default();
        Ok(match LogFileRepr::deserialize(deserializer)? {
            LogFileRepr::Path(path) => Self::from_path(path),
            LogFileRepr::Table {
                directory,
                file_prefix,
                max_file_size_mb,
                max_files,
            } => Self {
                directory: directory.unwrap_or(defaults.directory),
                file_prefix: file_prefix.unwrap_or(defaults.file_prefix),
                max_file_size_mb: max_file_size_mb.unwrap_or(defaults.max_file_size_mb),
                max_files: max_files.unwrap_or(defaults.max_files),
            },
        })
    }
}

/// Span export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name for tracing
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Deployment environment, e.g. "development" or "production"
    pub environment: String,
    /// Optional OTLP configuration for OpenTelemetry export
    pub otlp: Option<OtlpConfig>,
    /// Print completed spans to the console (development only)
    pub console_spans: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "roster".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            otlp: None,
            console_spans: false,
        }
    }
}

impl TelemetryConfig {
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }
}

/// OpenTelemetry Protocol (OTLP) configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtlpConfig {
    /// OTLP endpoint URL
    pub endpoint: String,
    /// Headers sent with every export, a table or `key=value,key2=value2`
    #[serde(default, deserialize_with = "deserialize_headers")]
    pub headers: HashMap<String, String>,
}

impl OtlpConfig {
    /// Path the trace signal is posted to under the base endpoint
    pub const TRACES_PATH: &'static str = "/v1/traces";

    /// URL spans are exported to
    ///
    /// `endpoint` is a collector base URL, as in `OTEL_EXPORTER_OTLP_ENDPOINT`,
    /// and gets the trace signal path appended. A URL that already ends in
    /// that path is used as is.
    pub fn traces_endpoint(&self) -> String {
        let base = self.endpoint.trim().trim_end_matches('/');
        if base.ends_with(Self::TRACES_PATH) {
            base.to_string()
        } else {
            format!("{base}{}", Self::TRACES_PATH)
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HeadersRepr {
    Map(HashMap<String, String>),
    List(String),
}

fn deserialize_headers<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match HeadersRepr::deserialize(deserializer)? {
        HeadersRepr::Map(map) => map,
        HeadersRepr::List(list) => parse_headers(&list),
    })
}

/// Parse a comma-separated `key=value` list
///
/// Whitespace around keys and values is trimmed and entries without `=` or
/// with an empty key are skipped.
pub fn parse_headers(list: &str) -> HashMap<String, String> {
    list.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}
