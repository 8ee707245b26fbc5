//! Configuration management for the Roster server
//!
//! Sources are layered with the `config` crate, lowest precedence first:
//! built-in defaults, an optional TOML/YAML file, then `ROSTER__` prefixed
//! environment variables using `__` as the separator (for example
//! `ROSTER__SERVER__BIND_ADDR` or `ROSTER__LOGGING__LEVEL`).
//!
//! The conventional variables below are applied on top of that:
//!
//! | Variable                      | Setting                       |
//! |-------------------------------|-------------------------------|
//! | `DATABASE_URL`                | `database.url`                |
//! | `ENVIRONMENT`                 | `telemetry.environment`       |
//! | `LOG_LEVEL`                   | `logging.level`               |
//! | `LOG_FORMAT`                  | `logging.format`              |
//! | `LOG_FILE`                    | `logging.file`                |
//! | `OTEL_SERVICE_NAME`           | `telemetry.service_name`      |
//! | `OTEL_SERVICE_VERSION`        | `telemetry.service_version`   |
//! | `OTEL_CONSOLE_SPANS`          | `telemetry.console_spans`     |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | `telemetry.otlp.endpoint`     |
//! | `OTEL_EXPORTER_OTLP_HEADERS`  | `telemetry.otlp.headers`      |
//!
//! Empty values are ignored.

use std::net::SocketAddr;
use std::path::Path;

use config::{Config, Environment, File, Map};
use roster_core::CoreError;
use roster_core::tracing::config::parse_headers;
use roster_core::tracing::{LogFileConfig, LoggingConfig, OtlpConfig, TelemetryConfig};
use roster_http::{ServiceInfo, TraceIdConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Complete server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingConfig,
    pub telemetry: TelemetryConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Name reported by the root endpoint
    pub name: String,
    /// Address to bind the HTTP server
    pub bind_addr: SocketAddr,
    /// Header carrying the trace ID in both directions
    pub trace_header: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "Roster".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            trace_header: roster_http::middleware::TRACE_ID_HEADER.to_string(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL; users are kept in memory without one
    pub url: Option<String>,
    pub max_connections: u32,
    /// Apply the embedded migrations at startup
    pub run_migrations: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            run_migrations: true,
        }
    }
}

impl Settings {
    /// Load settings from the process environment and an optional file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a value cannot be parsed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, std::env::vars().collect())
    }

    /// Load settings with `vars` standing in for the process environment
    pub fn load_from(path: Option<&Path>, vars: Map<String, String>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("ROSTER")
                .separator("__")
                .try_parsing(true)
                .source(Some(vars.clone())),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_overrides(|key| vars.get(key).cloned())?;
        Ok(settings)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(url) = var("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(environment) = var("ENVIRONMENT") {
            self.telemetry.environment = environment;
        }

        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(path) = var("LOG_FILE") {
            self.logging.file = Some(LogFileConfig::from_path(path));
        }

        if let Some(name) = var("OTEL_SERVICE_NAME") {
            self.telemetry.service_name = name;
        }
        if let Some(version) = var("OTEL_SERVICE_VERSION") {
            self.telemetry.service_version = version;
        }
        if let Some(flag) = var("OTEL_CONSOLE_SPANS") {
            self.telemetry.console_spans = parse_flag("OTEL_CONSOLE_SPANS", &flag)?;
        }
        if let Some(endpoint) = var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            let headers = self
                .telemetry
                .otlp
                .take()
                .map(|otlp| otlp.headers)
                .unwrap_or_default();
            self.telemetry.otlp = Some(OtlpConfig { endpoint, headers });
        }
        // Headers without an endpoint have nothing to attach to
        if let (Some(headers), Some(otlp)) = (
            var("OTEL_EXPORTER_OTLP_HEADERS"),
            self.telemetry.otlp.as_mut(),
        ) {
            otlp.headers = parse_headers(&headers);
        }

        Ok(())
    }

    /// Facts reported by the health and root endpoints
    pub fn service_info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.server.name.clone(),
            version: self.telemetry.service_version.clone(),
            environment: self.telemetry.environment.clone(),
        }
    }

    pub fn trace_config(&self) -> Result<TraceIdConfig> {
        TraceIdConfig::with_header(&self.server.trace_header)
            .map_err(|_| ServerError::InvalidTraceHeader(self.server.trace_header.clone()))
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ServerError::Core(CoreError::invalid_config(format!(
            "{key} must be a boolean, got '{value}'"
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::tracing::LogFormat;
    use std::io::Write;
    use std::path::PathBuf;

    fn vars(pairs: &[(&str, &str)]) -> Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::load_from(None, Map::new()).unwrap();

        assert_eq!(settings.server.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8000)));
        assert_eq!(settings.server.trace_header, "x-trace-id");
        assert!(settings.database.url.is_none());
        assert!(settings.database.run_migrations);
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert!(settings.telemetry.otlp.is_none());
        assert!(!settings.telemetry.console_spans);
    }

    #[test]
    fn test_file_then_prefixed_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
bind_addr = "0.0.0.0:9000"

[logging]
level = "debug"
format = "standard"
file = "logs/api.log"

[database]
max_connections = 3
"#
        )
        .unwrap();

        let settings = Settings::load_from(
            Some(file.path()),
            vars(&[
                ("ROSTER__LOGGING__LEVEL", "warn"),
                ("ROSTER__DATABASE__RUN_MIGRATIONS", "false"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.server.bind_addr, SocketAddr::from(([0, 0, 0, 0], 9000)));
        assert_eq!(settings.logging.level, "warn");
        assert_eq!(settings.logging.format, LogFormat::Standard);
        assert_eq!(settings.database.max_connections, 3);
        assert!(!settings.database.run_migrations);

        let log_file = settings.logging.file.unwrap();
        assert_eq!(log_file.directory, PathBuf::from("logs"));
        assert_eq!(log_file.file_prefix, "api");
    }

    #[test]
    fn test_conventional_variables() {
        let settings = Settings::load_from(
            None,
            vars(&[
                ("DATABASE_URL", "postgres://localhost/roster"),
                ("ENVIRONMENT", "production"),
                ("LOG_LEVEL", "debug"),
                ("LOG_FORMAT", "standard"),
                ("LOG_FILE", "/var/log/roster/app.log"),
                ("OTEL_SERVICE_NAME", "roster-api"),
                ("OTEL_CONSOLE_SPANS", "true"),
                ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://127.0.0.1:4318"),
                ("OTEL_EXPORTER_OTLP_HEADERS", "api-key=abc, tenant = t1"),
            ]),
        )
        .unwrap();

        assert_eq!(
            settings.database.url.as_deref(),
            Some("postgres://localhost/roster")
        );
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.logging.format, LogFormat::Standard);
        assert_eq!(
            settings.logging.file.unwrap().directory,
            PathBuf::from("/var/log/roster")
        );

        assert_eq!(settings.telemetry.environment, "production");
        assert_eq!(settings.telemetry.service_name, "roster-api");
        assert!(settings.telemetry.console_spans);
        let otlp = settings.telemetry.otlp.unwrap();
        assert_eq!(otlp.endpoint, "http://127.0.0.1:4318");
        assert_eq!(otlp.headers.get("api-key").map(String::as_str), Some("abc"));
        assert_eq!(otlp.headers.get("tenant").map(String::as_str), Some("t1"));
    }

    #[test]
    fn test_empty_and_orphaned_values_are_ignored() {
        let settings = Settings::load_from(
            None,
            vars(&[
                ("LOG_LEVEL", "  "),
                ("OTEL_EXPORTER_OTLP_ENDPOINT", ""),
                ("OTEL_EXPORTER_OTLP_HEADERS", "api-key=abc"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.logging.level, "info");
        assert!(settings.telemetry.otlp.is_none());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Settings::load_from(None, vars(&[("LOG_FORMAT", "xml")])).unwrap_err();
        assert!(matches!(err, ServerError::Core(CoreError::InvalidConfig { .. })));

        let err =
            Settings::load_from(None, vars(&[("OTEL_CONSOLE_SPANS", "sometimes")])).unwrap_err();
        assert!(err.to_string().contains("OTEL_CONSOLE_SPANS"));
    }

    #[test]
    fn test_derived_configs() {
        let mut settings = Settings::default();
        settings.telemetry.environment = "staging".to_string();

        let info = settings.service_info();
        assert_eq!(info.name, "Roster");
        assert_eq!(info.environment, "staging");

        settings.server.trace_header = "X-Request-Trace".to_string();
        let trace = settings.trace_config().unwrap();
        assert_eq!(trace.header_name.as_str(), "x-request-trace");

        settings.server.trace_header = "bad header".to_string();
        assert!(matches!(
            settings.trace_config(),
            Err(ServerError::InvalidTraceHeader(_))
        ));
    }
}
