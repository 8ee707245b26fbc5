//! Initialization functions for logging and tracing
//!
//! This module installs the global subscriber: the console and file log
//! sinks sharing one formatter, optional console span output, and with the
//! `otlp` feature the OpenTelemetry export pipeline.

use std::sync::Arc;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, Layer, filter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{CoreError, CoreResult};
use crate::tracing::config::{LogFormat, LoggingConfig, TelemetryConfig};
use crate::tracing::file_rotation::SizeBasedAppender;
use crate::tracing::format::{EventFormatter, JsonFormatter, LogFormatter, StandardFormatter};

/// Crates that only log at warn and above unless `RUST_LOG` says otherwise
const QUIET_TARGETS: &[&str] = &["sqlx", "hyper", "h2", "reqwest", "tower", "opentelemetry"];

/// Keeps the logging pipeline alive; flushes and shuts it down on drop
#[must_use = "dropping the guard stops file logging and span export"]
pub struct TelemetryGuard {
    file_guard: Option<WorkerGuard>,
    #[cfg(feature = "otlp")]
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl std::fmt::Debug for TelemetryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryGuard")
            .field("file", &self.file_guard.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otlp")]
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {e}");
            }
        }
        // Flushes buffered lines to the file sink
        self.file_guard.take();
    }
}

/// Build the event filter; `RUST_LOG` overrides the configured level
pub fn build_filter(level: &str) -> CoreResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let mut directives = vec![level.trim().to_ascii_lowercase()];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    EnvFilter::try_new(directives.join(","))
        .map_err(|e| CoreError::invalid_config(format!("invalid log level '{level}': {e}")))
}

/// The formatter shared by every log sink
pub fn build_formatter(logging: &LoggingConfig, telemetry: &TelemetryConfig) -> Arc<dyn LogFormatter> {
    match logging.format {
        LogFormat::Json => Arc::new(JsonFormatter {
            indent: logging.json_indent,
            include_timestamp: logging.include_timestamp,
            include_level: logging.include_level,
            include_caller: logging.include_caller,
        }),
        LogFormat::Standard => Arc::new(StandardFormatter::new(
            logging.use_colors && telemetry.is_development(),
        )),
    }
}

/// Install the global subscriber
pub fn init_logging(
    logging: &LoggingConfig,
    telemetry: &TelemetryConfig,
) -> CoreResult<TelemetryGuard> {
    let env_filter = build_filter(&logging.level)?;
    let formatter = build_formatter(logging, telemetry);

    let console_layer = tracing_subscriber::fmt::layer()
        .event_format(EventFormatter::new(Arc::clone(&formatter)))
        .with_writer(std::io::stdout);

    let (file_layer, file_guard) = match &logging.file {
        Some(file) => {
            let appender = SizeBasedAppender::from_config(file)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .event_format(EventFormatter::new(Arc::clone(&formatter)))
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // Completed spans only, events are already handled by the console layer
    let span_layer = (telemetry.console_spans && telemetry.is_development()).then(|| {
        tracing_subscriber::fmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter::filter_fn(|metadata| metadata.is_span()))
    });

    #[cfg(feature = "otlp")]
    let (otel_layer, tracer_provider) = match &telemetry.otlp {
        Some(otlp) => {
            use opentelemetry::trace::TracerProvider as _;

            let provider = exporter::tracer_provider(telemetry, otlp)?;
            let tracer = provider.tracer(telemetry.service_name.clone());
            (
                Some(tracing_opentelemetry::layer().with_tracer(tracer)),
                Some(provider),
            )
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .with(span_layer);

    #[cfg(feature = "otlp")]
    let registry = registry.with(otel_layer);

    registry
        .try_init()
        .map_err(|e| CoreError::telemetry_error(format!("subscriber already installed: {e}")))?;

    #[cfg(not(feature = "otlp"))]
    if telemetry.otlp.is_some() {
        tracing::warn!("OTLP export requested but the otlp feature is not enabled");
    }

    tracing::debug!(
        format = ?logging.format,
        file = logging.file.is_some(),
        otlp = telemetry.otlp.is_some(),
        "Logging initialized"
    );

    Ok(TelemetryGuard {
        file_guard,
        #[cfg(feature = "otlp")]
        tracer_provider,
    })
}

#[cfg(feature = "otlp")]
mod exporter {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    use crate::error::{CoreError, CoreResult};
    use crate::tracing::config::{OtlpConfig, TelemetryConfig};

    /// Batch exporter over OTLP/HTTP; export happens off the request path
    pub(super) fn tracer_provider(
        telemetry: &TelemetryConfig,
        otlp: &OtlpConfig,
    ) -> CoreResult<SdkTracerProvider> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(otlp.traces_endpoint())
            .with_headers(otlp.headers.clone())
            .build()
            .map_err(|e| CoreError::telemetry_error(format!("OTLP exporter: {e}")))?;

        let resource = Resource::builder()
            .with_service_name(telemetry.service_name.clone())
            .with_attributes([
                KeyValue::new("service.version", telemetry.service_version.clone()),
                KeyValue::new("deployment.environment", telemetry.environment.clone()),
            ])
            .build();

        Ok(SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build())
    }
}
