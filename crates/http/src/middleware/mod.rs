//! Middleware components for HTTP request processing

pub mod trace_id;

pub use trace_id::{
    Resolution, TRACE_ID_HEADER, TraceIdConfig, resolve_trace_id, trace_id_middleware,
};
