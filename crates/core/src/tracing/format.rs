//! Log line formatting
//!
//! Every event is turned into a [`LogRecord`] and rendered by a
//! [`LogFormatter`]: [`JsonFormatter`] for machine consumption or
//! [`StandardFormatter`] for people. The trace and span identifiers are
//! looked up in the correlation context when the line is formatted, and
//! query-execution notifications are rewritten into readable SQL first.

use std::collections::BTreeMap;
use std::fmt;
use std::io::IsTerminal;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use colored::Colorize;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::tracing::correlation;
use crate::tracing::sql::{self, StatementPairing};
use crate::tracing::trace_context::TraceContext;

/// Connection key used for paired notifications that do not name one
const DEFAULT_CONNECTION: &str = "default";

/// Field names with a meaning of their own, never copied into `extra`
const RESERVED_FIELDS: &[&str] = &[
    "message",
    "trace_id",
    "span_id",
    "exception",
    "error",
    "stack_info",
    "critical",
];

/// Severity of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        match *level {
            Level::TRACE | Level::DEBUG => Self::Debug,
            Level::INFO => Self::Info,
            Level::WARN => Self::Warning,
            Level::ERROR => Self::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event was emitted from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub target: String,
    pub module: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl Caller {
    pub fn from_metadata(metadata: &Metadata<'_>) -> Self {
        Self {
            target: metadata.target().to_string(),
            module: metadata.module_path().map(str::to_string),
            file: metadata.file().map(str::to_string),
            line: metadata.line(),
        }
    }

    /// `target:module:line`, the module omitted when it equals the target
    pub fn qualified(&self) -> String {
        let mut out = self.target.clone();
        if let Some(module) = self.module.as_deref().filter(|m| *m != self.target) {
            out.push(':');
            out.push_str(module);
        }
        if let Some(line) = self.line {
            out.push_str(&format!(":{line}"));
        }
        out
    }

    /// `file:line` using the file name only
    pub fn location(&self) -> String {
        let file = self
            .file
            .as_deref()
            .and_then(|f| Path::new(f).file_name())
            .and_then(|f| f.to_str())
            .unwrap_or(&self.target);
        match self.line {
            Some(line) => format!("{file}:{line}"),
            None => file.to_string(),
        }
    }
}

/// One event, ready to be rendered
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub caller: Caller,
    pub message: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub extra: BTreeMap<String, Value>,
    pub exception: Option<String>,
    pub stack_info: Option<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            caller: Caller {
                target: target.into(),
                ..Caller::default()
            },
            message: message.into(),
            trace_id: None,
            span_id: None,
            extra: BTreeMap::new(),
            exception: None,
            stack_info: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    /// Stamp the record with the identifiers of `ctx`, if any
    pub fn with_correlation(mut self, ctx: Option<TraceContext>) -> Self {
        self.trace_id = ctx.map(|c| c.trace_id().to_hex());
        self.span_id = ctx.map(|c| c.span_id().to_hex());
        self
    }

    /// Build a record from a `tracing` event
    pub fn from_event(event: &Event<'_>) -> (Self, SqlNotification) {
        let metadata = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let level = if visitor.critical {
            LogLevel::Critical
        } else {
            LogLevel::from(metadata.level())
        };

        let record = Self {
            timestamp: Utc::now(),
            level,
            caller: Caller::from_metadata(metadata),
            message: visitor.message.unwrap_or_default(),
            trace_id: None,
            span_id: None,
            extra: visitor.extra,
            exception: visitor.exception,
            stack_info: visitor.stack_info,
        };
        (record, visitor.sql)
    }

    /// Degraded rendering used when a formatter cannot do its job
    pub fn fallback_line(&self) -> String {
        format!("{} {} {}", self.level, self.caller.target, self.message)
    }
}

/// Fields of a query-execution notification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlNotification {
    /// Statement template (`sql.statement`)
    pub statement: Option<String>,
    /// Bound parameters of a combined notification (`sql.params`)
    pub params: Option<String>,
    /// Parameter dump of a paired notification (`sql.parameters`)
    pub parameters: Option<String>,
    /// Connection the paired notification belongs to (`sql.connection`)
    pub connection: Option<String>,
}

impl SqlNotification {
    fn is_paired(&self) -> bool {
        self.connection.is_some() || (self.parameters.is_some() && self.params.is_none())
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    extra: BTreeMap<String, Value>,
    exception: Option<String>,
    stack_info: Option<String>,
    critical: bool,
    sql: SqlNotification,
}

impl RecordVisitor {
    fn record_value(&mut self, field: &Field, value: Value) {
        let name = field.name();
        match name {
            "message" => self.message = Some(value_text(value)),
            "exception" | "error" => self.exception = Some(value_text(value)),
            "stack_info" => self.stack_info = Some(value_text(value)),
            "critical" => self.critical = matches!(value, Value::Bool(true)),
            "sql.statement" => self.sql.statement = Some(value_text(value)),
            "sql.params" => self.sql.params = Some(value_text(value)),
            "sql.parameters" => self.sql.parameters = Some(value_text(value)),
            "sql.connection" => self.sql.connection = Some(value_text(value)),
            _ if RESERVED_FIELDS.contains(&name) || name.starts_with("log.") => {}
            _ => {
                self.extra.insert(name.to_string(), value);
            }
        }
    }
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_value(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, Value::String(value.to_string()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, Value::Bool(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        // NaN and infinities are not JSON numbers
        let value = serde_json::Number::from_f64(value)
            .map_or_else(|| Value::String(value.to_string()), Value::Number);
        self.record_value(field, value);
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        let mut text = value.to_string();
        let mut source = value.source();
        while let Some(cause) = source {
            text.push_str("\nCaused by: ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }

        match field.name() {
            "exception" | "error" => self.exception = Some(text),
            _ => self.record_value(field, Value::String(text)),
        }
    }
}

/// Renders a record into one log entry
pub trait LogFormatter: Send + Sync {
    fn format(&self, record: &LogRecord) -> String;
}

/// JSON encoding, one object per entry
#[derive(Debug, Clone)]
pub struct JsonFormatter {
    /// Pretty-print with this many spaces, compact when `None`
    pub indent: Option<usize>,
    pub include_timestamp: bool,
    pub include_level: bool,
    pub include_caller: bool,
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self {
            indent: None,
            include_timestamp: true,
            include_level: true,
            include_caller: true,
        }
    }
}

impl JsonFormatter {
    fn to_value(&self, record: &LogRecord) -> Value {
        let mut object = Map::new();
        if self.include_timestamp {
            object.insert(
                "timestamp".into(),
                record
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Micros, true)
                    .into(),
            );
        }
        if self.include_level {
            object.insert("level".into(), record.level.as_str().into());
        }
        if self.include_caller {
            object.insert("caller".into(), record.caller.qualified().into());
        }
        if let Some(trace_id) = &record.trace_id {
            object.insert("trace_id".into(), trace_id.clone().into());
        }
        if let Some(span_id) = &record.span_id {
            object.insert("span_id".into(), span_id.clone().into());
        }
        object.insert("message".into(), record.message.clone().into());
        if !record.extra.is_empty() {
            let extra: Map<String, Value> = record
                .extra
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            object.insert("extra".into(), Value::Object(extra));
        }
        if let Some(exception) = &record.exception {
            object.insert("exception".into(), exception.clone().into());
        }
        if let Some(stack_info) = &record.stack_info {
            object.insert("stack_info".into(), stack_info.clone().into());
        }
        Value::Object(object)
    }

    fn encode(&self, value: &Value) -> Result<String, serde_json::Error> {
        let Some(indent) = self.indent else {
            return serde_json::to_string(value);
        };
        let indent = " ".repeat(indent);
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        value.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl LogFormatter for JsonFormatter {
    fn format(&self, record: &LogRecord) -> String {
        self.encode(&self.to_value(record))
            .unwrap_or_else(|_| record.fallback_line())
    }
}

/// `timestamp - file:line - LEVEL - [trace:…,span:…] message`
#[derive(Debug, Clone, Default)]
pub struct StandardFormatter {
    colors: bool,
}

impl StandardFormatter {
    /// Colors are only used when stdout is a terminal
    pub fn new(use_colors: bool) -> Self {
        Self {
            colors: use_colors && std::io::stdout().is_terminal(),
        }
    }

    pub fn plain() -> Self {
        Self { colors: false }
    }

    fn level(&self, level: LogLevel) -> String {
        if !self.colors {
            return level.as_str().to_string();
        }
        let name = level.as_str();
        match level {
            LogLevel::Debug => name.cyan(),
            LogLevel::Info => name.green(),
            LogLevel::Warning => name.yellow(),
            LogLevel::Error => name.red(),
            LogLevel::Critical => name.magenta(),
        }
        .to_string()
    }
}

impl LogFormatter for StandardFormatter {
    fn format(&self, record: &LogRecord) -> String {
        let mut line = format!(
            "{} - {} - {} - ",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.caller.location(),
            self.level(record.level),
        );

        let ids: Vec<String> = [
            record.trace_id.as_ref().map(|id| format!("trace:{id}")),
            record.span_id.as_ref().map(|id| format!("span:{id}")),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !ids.is_empty() {
            line.push_str(&format!("[{}] ", ids.join(",")));
        }

        line.push_str(&record.message);
        if let Some(exception) = &record.exception {
            line.push('\n');
            line.push_str(exception);
        }
        if let Some(stack_info) = &record.stack_info {
            line.push('\n');
            line.push_str(stack_info);
        }
        line
    }
}

/// Bridges a [`LogFormatter`] into `tracing_subscriber::fmt`
///
/// Layers writing to different sinks can share one formatter; each keeps its
/// own statement pairing so a notification is never consumed twice.
pub struct EventFormatter {
    formatter: Arc<dyn LogFormatter>,
    pairing: Mutex<StatementPairing>,
}

impl EventFormatter {
    pub fn new(formatter: Arc<dyn LogFormatter>) -> Self {
        Self {
            formatter,
            pairing: Mutex::new(StatementPairing::new()),
        }
    }

    /// Readable text of a query-execution notification, `None` to drop it
    fn rewrite_sql(&self, message: &str, notification: &SqlNotification) -> Option<String> {
        if notification.is_paired() {
            let connection = notification
                .connection
                .as_deref()
                .unwrap_or(DEFAULT_CONNECTION);
            let mut pairing = self.pairing.lock().unwrap_or_else(PoisonError::into_inner);
            return match (&notification.statement, &notification.parameters) {
                (Some(statement), _) => pairing.on_statement(connection, statement),
                (None, Some(dump)) => pairing.on_parameters(connection, dump),
                (None, None) => Some(message.to_string()),
            };
        }

        match &notification.statement {
            Some(statement) => {
                sql::reconstruct_raw(statement, notification.params.as_deref().unwrap_or(""))
            }
            None if sql::is_setup_probe(message) => None,
            None => Some(message.to_string()),
        }
    }

    /// Render an event, `None` when it must not be written
    pub fn render(&self, event: &Event<'_>) -> Option<String> {
        let (mut record, notification) = LogRecord::from_event(event);
        if sql::is_sql_target(&record.caller.target) {
            record.message = self.rewrite_sql(&record.message, &notification)?;
        }
        let record = record.with_correlation(correlation::get());

        let formatter = &self.formatter;
        Some(
            catch_unwind(AssertUnwindSafe(|| formatter.format(&record)))
                .unwrap_or_else(|_| record.fallback_line()),
        )
    }
}

impl<S, N> FormatEvent<S, N> for EventFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        match self.render(event) {
            Some(line) => writeln!(writer, "{line}"),
            None => Ok(()),
        }
    }
}
