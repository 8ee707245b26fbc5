//! Per-request trace context
//!
//! A [`TraceContext`] pairs the trace identity of a request with the span
//! that handles it. With the `otlp` feature it converts into the remote
//! parent the exported request span is attached to.

use serde::{Deserialize, Serialize};

use crate::tracing::ids::{SpanId, TraceId};

/// Trace identity of one request: the trace it belongs to and its own span
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext {
    trace_id: TraceId,
    span_id: SpanId,
    sampled: bool,
}

impl TraceContext {
    /// Create a new trace context with random IDs
    pub fn new() -> Self {
        Self::with_trace_id(TraceId::random())
    }

    /// Join an existing trace with a freshly minted span
    pub fn with_trace_id(trace_id: TraceId) -> Self {
        Self::from_parts(trace_id, SpanId::random())
    }

    /// Assemble a context from known parts
    pub const fn from_parts(trace_id: TraceId, span_id: SpanId) -> Self {
        Self {
            trace_id,
            span_id,
            sampled: true,
        }
    }

    pub const fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub const fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub const fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Convert to an OpenTelemetry remote span context
    #[cfg(feature = "otlp")]
    pub fn to_span_context(&self) -> opentelemetry::trace::SpanContext {
        use opentelemetry::trace::{
            SpanContext, SpanId as OtelSpanId, TraceFlags, TraceId as OtelTraceId, TraceState,
        };

        SpanContext::new(
            OtelTraceId::from_bytes(self.trace_id.to_bytes()),
            OtelSpanId::from_bytes(self.span_id.to_bytes()),
            if self.sampled {
                TraceFlags::SAMPLED
            } else {
                TraceFlags::default()
            },
            true,
            TraceState::default(),
        )
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trace_context() {
        let ctx1 = TraceContext::new();
        let ctx2 = TraceContext::new();

        assert_ne!(ctx1.trace_id(), ctx2.trace_id());
        assert_ne!(ctx1.span_id(), ctx2.span_id());
        assert!(ctx1.is_sampled());
    }

    #[test]
    fn test_with_trace_id_keeps_trace() {
        let trace_id = TraceId::parse_lenient("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
        let a = TraceContext::with_trace_id(trace_id);
        let b = TraceContext::with_trace_id(trace_id);

        assert_eq!(a.trace_id(), trace_id);
        assert_eq!(b.trace_id(), trace_id);
        // Span identity is never inherited
        assert_ne!(a.span_id(), b.span_id());
    }

    #[test]
    fn test_from_parts() {
        let trace_id = TraceId::random();
        let span_id = SpanId::from_bytes([0, 0, 0, 0, 0, 0, 0, 7]);
        let ctx = TraceContext::from_parts(trace_id, span_id);
        assert_eq!(ctx.trace_id(), trace_id);
        assert_eq!(ctx.span_id().to_hex(), "0000000000000007");
    }

    #[cfg(feature = "otlp")]
    #[test]
    fn test_to_span_context() {
        let ctx = TraceContext::new();
        let span_context = ctx.to_span_context();

        assert!(span_context.is_valid());
        assert!(span_context.is_remote());
        assert_eq!(span_context.trace_id().to_string(), ctx.trace_id().to_string());
        assert_eq!(span_context.span_id().to_string(), ctx.span_id().to_string());
    }
}
