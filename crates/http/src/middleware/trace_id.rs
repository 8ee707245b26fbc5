//! Trace ID middleware for request correlation
//!
//! Every request is tied to a trace: the caller may hand one in through the
//! trace header, otherwise a new one is minted. The span ID is always fresh;
//! when the request span is exported it is the id of that exported span.
//! The resolved identity is installed in the correlation context for the
//! whole handler chain and echoed back in the same header on the response.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use axum::{
    extract::{MatchedPath, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, header::USER_AGENT},
    middleware::Next,
    response::Response,
};
use futures::FutureExt;
use roster_core::tracing::{TraceContext, TraceId, correlation};
use tracing::Instrument;

/// Default header carrying the trace ID in both directions
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Trace ID middleware configuration
#[derive(Debug, Clone)]
pub struct TraceIdConfig {
    pub header_name: HeaderName,
}

impl Default for TraceIdConfig {
    fn default() -> Self {
        Self {
            header_name: HeaderName::from_static(TRACE_ID_HEADER),
        }
    }
}

impl TraceIdConfig {
    /// Use a custom header; names are case-insensitive
    pub fn with_header(name: &str) -> Result<Self, http::header::InvalidHeaderName> {
        Ok(Self {
            header_name: HeaderName::from_bytes(name.trim().as_bytes())?,
        })
    }
}

/// Where the trace ID of a request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Taken from the inbound header
    Inherited,
    /// No header was sent
    Generated,
    /// The header was present but not a valid trace ID
    Replaced,
}

/// Pick the trace ID for a request
pub fn resolve_trace_id(headers: &HeaderMap, header_name: &HeaderName) -> (TraceId, Resolution) {
    let Some(value) = headers.get(header_name).filter(|v| !v.is_empty()) else {
        return (TraceId::random(), Resolution::Generated);
    };

    match value.to_str().ok().and_then(TraceId::parse_lenient) {
        Some(trace_id) => (trace_id, Resolution::Inherited),
        None => (TraceId::random(), Resolution::Replaced),
    }
}

/// Middleware function for request correlation
///
/// Handler panics are logged with the request's identity and then resumed
/// unchanged; turning them into a response is left to an outer layer.
pub async fn trace_id_middleware(
    State(config): State<TraceIdConfig>,
    request: Request,
    next: Next,
) -> Response {
    let (trace_id, resolution) = resolve_trace_id(request.headers(), &config.header_name);
    // An inherited ID goes back exactly as the caller sent it
    let echoed = match resolution {
        Resolution::Inherited => request.headers().get(&config.header_name).cloned(),
        Resolution::Generated | Resolution::Replaced => None,
    };

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| path.clone(), |matched| matched.as_str().to_string());
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let span = tracing::info_span!(
        "http_request",
        otel.name = %format!("{method} {path}"),
        otel.kind = "server",
        http.method = %method,
        http.url = %request.uri(),
        http.route = %route,
        http.user_agent = %user_agent,
        trace.id = %trace_id,
        http.status_code = tracing::field::Empty,
    );

    let ctx = join_trace(&span, TraceContext::with_trace_id(trace_id));

    let header_name = config.header_name;
    let handled = async move {
        match resolution {
            Resolution::Inherited => tracing::debug!("Using trace ID from request"),
            Resolution::Generated => tracing::debug!("Generated new trace ID"),
            Resolution::Replaced => {
                tracing::debug!(header = %header_name, "Invalid trace ID in request, generated new")
            }
        }

        match AssertUnwindSafe(next.run(request)).catch_unwind().await {
            Ok(mut response) => {
                let status = response.status();
                tracing::Span::current().record("http.status_code", status.as_u16());

                match echoed.map_or_else(|| HeaderValue::from_str(&trace_id.to_hex()), Ok) {
                    Ok(value) => {
                        response.headers_mut().insert(header_name, value);
                    }
                    Err(e) => tracing::warn!("Failed to set trace ID header: {}", e),
                }

                tracing::info!(
                    method = %method,
                    path = %path,
                    status_code = status.as_u16(),
                    "Request processed"
                );
                Ok(response)
            }
            Err(panic) => {
                tracing::error!(
                    method = %method,
                    path = %path,
                    exception = %panic_message(panic.as_ref()),
                    stack_info = %std::backtrace::Backtrace::capture(),
                    "Error processing request"
                );
                Err(panic)
            }
        }
    }
    .instrument(span);

    match correlation::scope(ctx, handled).await {
        Ok(response) => response,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Attach the request span to the resolved trace
///
/// The exporter assigns the span its own id, and that id is the one logged so
/// log lines can be matched with exported spans. Without an OpenTelemetry
/// layer the span records nothing and `parent` is used as is.
#[cfg(feature = "otlp")]
fn join_trace(span: &tracing::Span, parent: TraceContext) -> TraceContext {
    use opentelemetry::trace::TraceContextExt as _;
    use roster_core::tracing::SpanId;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    span.set_parent(
        opentelemetry::Context::new().with_remote_span_context(parent.to_span_context()),
    );

    let otel = span.context();
    let exported = otel.span().span_context().clone();
    if exported.is_valid() && exported.trace_id().to_bytes() == parent.trace_id().to_bytes() {
        let span_id = SpanId::from_bytes(exported.span_id().to_bytes());
        TraceContext::from_parts(parent.trace_id(), span_id)
    } else {
        parent
    }
}

#[cfg(not(feature = "otlp"))]
fn join_trace(_span: &tracing::Span, parent: TraceContext) -> TraceContext {
    parent
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn name() -> HeaderName {
        TraceIdConfig::default().header_name
    }

    #[test]
    fn test_valid_header_is_inherited() {
        let id = "4bf92f3577b34da6a3ce929d0e0e4736";
        let (trace_id, resolution) = resolve_trace_id(&headers(id), &name());
        assert_eq!(resolution, Resolution::Inherited);
        assert_eq!(trace_id.to_hex(), id);
    }

    #[test]
    fn test_missing_header_generates() {
        let (trace_id, resolution) = resolve_trace_id(&HeaderMap::new(), &name());
        assert_eq!(resolution, Resolution::Generated);
        assert_eq!(trace_id.to_hex().len(), 32);

        let (_, resolution) = resolve_trace_id(&headers(""), &name());
        assert_eq!(resolution, Resolution::Generated);
    }

    #[test]
    fn test_malformed_header_is_replaced() {
        for bad in ["abc", "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz", "4bf92f3577b34da6a3ce929d0e0e47361"] {
            let (trace_id, resolution) = resolve_trace_id(&headers(bad), &name());
            assert_eq!(resolution, Resolution::Replaced, "{bad}");
            assert_ne!(trace_id.to_hex(), bad);
            assert_eq!(trace_id.to_hex().len(), 32);
        }
    }

    #[test]
    fn test_all_zero_header_is_replaced() {
        let zero = "00000000000000000000000000000000";
        let (trace_id, resolution) = resolve_trace_id(&headers(zero), &name());
        assert_eq!(resolution, Resolution::Replaced);
        assert_ne!(trace_id.to_hex(), zero);
    }

    #[test]
    fn test_custom_header_name() {
        let config = TraceIdConfig::with_header("X-Request-Trace").unwrap();
        assert_eq!(config.header_name.as_str(), "x-request-trace");
        assert!(TraceIdConfig::with_header("bad header").is_err());
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"boom".to_string()), "boom");
        assert_eq!(panic_message(&42_u8), "handler panicked");
    }
}
