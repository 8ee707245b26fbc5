//! Request correlation and structured logging for Roster
//!
//! Every log line written while a request is in flight carries the request's
//! trace and span ids, SQL notifications are rewritten into executable
//! statements, and the same records can be exported as OpenTelemetry spans.

pub mod config;
pub mod correlation;
pub mod file_rotation;
pub mod format;
pub mod ids;
pub mod init;
pub mod sql;
pub mod trace_context;

// Re-export commonly used types
pub use config::{LogFileConfig, LogFormat, LoggingConfig, OtlpConfig, TelemetryConfig};
pub use correlation::CorrelationScope;
pub use ids::{ParseIdError, SpanId, TraceId};
pub use init::{TelemetryGuard, init_logging};
pub use trace_context::TraceContext;
