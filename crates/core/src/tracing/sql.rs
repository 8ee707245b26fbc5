//! Readable SQL for the audit log
//!
//! Turns a parameterized statement and its bound values back into the
//! statement that was actually executed, e.g.
//! `SELECT * FROM users WHERE id = $1` with `[5]` becomes
//! `SELECT * FROM users WHERE id = 5`.
//!
//! Reconstruction is best effort. When the parameters cannot be matched to
//! the template the raw template is kept and the parameter dump is appended.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Connection setup probes issued by the driver, never logged
const SETUP_PROBES: &[&str] = &[
    "select pg_catalog.version",
    "select current_schema",
    "show standard_conforming",
];

/// Statement kinds that make it into the audit log
const LOGGED_VERBS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER",
];

/// Upper bound on templates waiting for their parameters
const MAX_PENDING: usize = 1024;

/// Target of the query-execution notifications emitted by the persistence layer
pub const SQL_TARGET: &str = "roster::sql";

/// Whether events from `target` are query-execution notifications
pub fn is_sql_target(target: &str) -> bool {
    target
        .strip_prefix(SQL_TARGET)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

lazy_static! {
    static ref CAST: Regex = Regex::new(r"\$(\d+)::\w+").expect("valid cast pattern");
    static ref POSITIONAL: Regex = Regex::new(r"\$(\d+)").expect("valid positional pattern");
    static ref NAMED: Regex =
        Regex::new(r"(^|[^:]):([A-Za-z_][A-Za-z0-9_]*)").expect("valid named pattern");
}

/// Errors raised while matching parameters to a template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    #[error("no value bound for placeholder ${0}")]
    MissingParameter(usize),
    #[error("no value bound for :{0}")]
    MissingNamedParameter(String),
    #[error("malformed parameter list: {0}")]
    MalformedParameters(String),
}

/// A bound parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Anything else, already stringified
    Other(String),
}

/// Bound parameters of one statement
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParams {
    Positional(Vec<SqlValue>),
    Named(Vec<(String, SqlValue)>),
}

impl SqlParams {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Positional(values) => values.is_empty(),
            Self::Named(values) => values.is_empty(),
        }
    }

    /// Encode for transport in a log field
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{Map, Value};
        match self {
            Self::Positional(values) => {
                Value::Array(values.iter().map(SqlValue::to_json).collect())
            }
            Self::Named(values) => Value::Object(
                values
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect::<Map<_, _>>(),
            ),
        }
    }

    /// Decode parameters carried in a log field; a scalar is a single parameter
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Array(values) => Self::Positional(values.iter().map(SqlValue::from).collect()),
            Value::Object(map) => Self::Named(
                map.iter()
                    .map(|(name, value)| (name.clone(), SqlValue::from(value)))
                    .collect(),
            ),
            other => Self::Positional(vec![SqlValue::from(other)]),
        }
    }
}

impl SqlValue {
    fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or_else(|| Value::String(f.to_string()), Value::Number),
            Self::Text(s) | Self::Other(s) => Value::String(s.clone()),
        }
    }
}

impl Default for SqlParams {
    fn default() -> Self {
        Self::Positional(Vec::new())
    }
}

/// Render a value the way it would be written in the statement
pub fn render_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Bool(true) => "TRUE".to_string(),
        SqlValue::Bool(false) => "FALSE".to_string(),
        SqlValue::Int(i) => i.to_string(),
        SqlValue::Float(f) if f.is_finite() => f.to_string(),
        SqlValue::Float(f) => quote(&f.to_string()),
        SqlValue::Text(s) | SqlValue::Other(s) => quote(s),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// A value as it appears in a parameter dump
///
/// Backslashes and control characters are escaped so that
/// [`parse_parameter_dump`] reads back exactly the bound value.
fn dump_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Text(s) | SqlValue::Other(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('\'');
            for c in s.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '\'' => out.push_str("''"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c => out.push(c),
                }
            }
            out.push('\'');
            out
        }
        other => render_literal(other),
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_literal(self))
    }
}

impl fmt::Display for SqlParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positional(values) => {
                f.write_str("(")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(&dump_literal(value))?;
                }
                f.write_str(")")
            }
            Self::Named(values) => {
                f.write_str("{")?;
                for (i, (name, value)) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{name}': {}", dump_literal(value))?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Whether `sql` is one of the driver's connection setup probes
pub fn is_setup_probe(sql: &str) -> bool {
    let collapsed = collapse_whitespace(sql).to_lowercase();
    SETUP_PROBES.iter().any(|probe| collapsed.contains(probe))
}

/// Whether `sql` is a statement kind that belongs in the audit log
pub fn is_loggable(sql: &str) -> bool {
    let head: String = sql
        .trim_start()
        .chars()
        .take(6)
        .collect::<String>()
        .to_uppercase();
    LOGGED_VERBS.iter().any(|verb| head.starts_with(verb))
}

fn collapse_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapse whitespace and drop `::type` casts trailing positional placeholders
pub fn normalize(sql: &str) -> String {
    CAST.replace_all(&collapse_whitespace(sql), "$$${1}")
        .into_owned()
}

/// Replace every placeholder in `sql` with the literal of its bound value
pub fn substitute(sql: &str, params: &SqlParams) -> Result<String, SqlError> {
    match params {
        SqlParams::Positional(values) => substitute_positional(sql, values),
        SqlParams::Named(values) => substitute_named(sql, values),
    }
}

fn substitute_positional(sql: &str, values: &[SqlValue]) -> Result<String, SqlError> {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for caps in POSITIONAL.captures_iter(sql) {
        let Some(whole) = caps.get(0) else { continue };
        let index: usize = caps[1]
            .parse()
            .map_err(|_| SqlError::MalformedParameters(caps[0].to_string()))?;
        let value = index
            .checked_sub(1)
            .and_then(|i| values.get(i))
            .ok_or(SqlError::MissingParameter(index))?;
        out.push_str(&sql[last..whole.start()]);
        out.push_str(&render_literal(value));
        last = whole.end();
    }
    out.push_str(&sql[last..]);
    Ok(out)
}

fn substitute_named(sql: &str, values: &[(String, SqlValue)]) -> Result<String, SqlError> {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for caps in NAMED.captures_iter(sql) {
        let Some(name) = caps.get(2) else { continue };
        let value = values
            .iter()
            .find(|(n, _)| n == name.as_str())
            .map(|(_, v)| v)
            .ok_or_else(|| SqlError::MissingNamedParameter(name.as_str().to_string()))?;
        // Keep the character matched in front of the colon
        let colon = name.start() - 1;
        out.push_str(&sql[last..colon]);
        out.push_str(&render_literal(value));
        last = name.end();
    }
    out.push_str(&sql[last..]);
    Ok(out)
}

/// Build the readable statement for one execution
///
/// Returns `None` for setup probes, which are never logged. Statements that
/// are not audit candidates come back unmodified.
pub fn reconstruct(sql: &str, params: &SqlParams) -> Option<String> {
    if is_setup_probe(sql) {
        return None;
    }
    if !is_loggable(sql) {
        return Some(sql.to_string());
    }

    let normalized = normalize(sql);
    if params.is_empty() {
        return Some(normalized);
    }
    Some(match substitute(&normalized, params) {
        Ok(statement) => statement,
        Err(e) => format!("{normalized} -- Parameters: {params} (Error: {e})"),
    })
}

/// Like [`reconstruct`], with the parameters still in their log field encoding
///
/// `raw` is the JSON array or object written by the persistence layer, or a
/// driver-style dump. An empty string means no parameters were bound.
pub fn reconstruct_raw(sql: &str, raw: &str) -> Option<String> {
    if is_setup_probe(sql) {
        return None;
    }
    if !is_loggable(sql) {
        return Some(sql.to_string());
    }

    let raw = raw.trim();
    if raw.is_empty() {
        return reconstruct(sql, &SqlParams::default());
    }
    let params = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => SqlParams::from_json(&value),
        Err(_) => match parse_parameter_dump(raw) {
            Ok(params) => params,
            Err(e) => {
                return Some(format!(
                    "{} -- Parameters: {raw} (Error: {e})",
                    normalize(sql)
                ));
            }
        },
    };
    reconstruct(sql, &params)
}

/// Parse the parameter dump carried by a standalone parameters notification
///
/// Accepts a tuple such as `('alice', 42, None, True)` or a mapping such as
/// `{'name': 'alice'}`, optionally preceded by a `[generated in …]` marker.
pub fn parse_parameter_dump(dump: &str) -> Result<SqlParams, SqlError> {
    let body = extract_dump(dump)
        .ok_or_else(|| SqlError::MalformedParameters(dump.to_string()))?;
    let (open, inner) = body.split_at(1);
    let inner = &inner[..inner.len() - 1];
    let items = split_top_level(inner, ',')?;

    if open == "{" {
        let mut named = Vec::with_capacity(items.len());
        for item in items {
            let parts = split_top_level(item, ':')?;
            let [key, value] = parts.as_slice() else {
                return Err(SqlError::MalformedParameters(item.to_string()));
            };
            let key = match parse_token(key)? {
                SqlValue::Text(k) | SqlValue::Other(k) => k,
                other => render_literal(&other),
            };
            named.push((key, parse_token(value)?));
        }
        Ok(SqlParams::Named(named))
    } else {
        items
            .into_iter()
            .map(parse_token)
            .collect::<Result<Vec<_>, _>>()
            .map(SqlParams::Positional)
    }
}

/// The `( … )` or `{ … }` part of a dump, markers stripped
fn extract_dump(dump: &str) -> Option<&str> {
    let dump = dump.trim();
    let dump = match dump.strip_prefix('[') {
        Some(rest) => rest.split_once(']')?.1.trim(),
        None => dump,
    };
    let closing = match dump.chars().next()? {
        '(' => ')',
        '[' => ']',
        '{' => '}',
        _ => return None,
    };
    dump.ends_with(closing).then_some(dump).filter(|d| d.len() >= 2)
}

/// Split on `sep` outside of quotes and brackets, dropping empty trailing items
fn split_top_level(s: &str, sep: char) -> Result<Vec<&str>, SqlError> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SqlError::MalformedParameters(s.to_string()))?;
            }
            c if c == sep && depth == 0 => {
                items.push(s[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if quote.is_some() || depth != 0 {
        return Err(SqlError::MalformedParameters(s.to_string()));
    }
    let tail = s[start..].trim();
    if !tail.is_empty() {
        items.push(tail);
    }
    Ok(items)
}

fn parse_token(token: &str) -> Result<SqlValue, SqlError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(SqlError::MalformedParameters(token.to_string()));
    }

    let first = token.chars().next().unwrap_or_default();
    if first == '\'' || first == '"' {
        return unquote(token, first).map(SqlValue::Text);
    }

    Ok(match token {
        "None" | "NULL" | "null" => SqlValue::Null,
        "True" | "TRUE" | "true" => SqlValue::Bool(true),
        "False" | "FALSE" | "false" => SqlValue::Bool(false),
        _ => {
            if let Ok(i) = token.parse::<i64>() {
                SqlValue::Int(i)
            } else if let Ok(f) = token.parse::<f64>() {
                SqlValue::Float(f)
            } else {
                SqlValue::Other(token.to_string())
            }
        }
    })
}

fn unquote(token: &str, q: char) -> Result<String, SqlError> {
    let malformed = || SqlError::MalformedParameters(token.to_string());
    let inner = token
        .strip_prefix(q)
        .and_then(|t| t.strip_suffix(q))
        .ok_or_else(malformed)?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        // SQL-style doubled quote
        if c == q && chars.peek() == Some(&q) {
            chars.next();
            out.push(q);
            continue;
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next().ok_or_else(malformed)? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Merge a template with the text of a later parameters notification
pub fn combine_with_dump(template: &str, dump: &str) -> String {
    match parse_parameter_dump(dump).and_then(|params| substitute(template, &params)) {
        Ok(statement) => statement,
        Err(_) => format!("{template} -- Parameters: {}", dump_body(dump)),
    }
}

fn dump_body(dump: &str) -> &str {
    match (dump.find('('), dump.rfind(')')) {
        (Some(start), Some(end)) if start < end => &dump[start..=end],
        _ => dump.trim(),
    }
}

#[derive(Debug, Clone)]
enum Pending {
    Template(String),
    Suppressed,
}

/// Pairs template notifications with the parameters that follow them
///
/// Drivers that report a statement and its parameters as two separate
/// notifications are correlated per connection, so two connections
/// interleaving their notifications never swap parameters. The pending
/// template is cleared as soon as its parameters arrive.
#[derive(Debug, Default)]
pub struct StatementPairing {
    pending: HashMap<String, Pending>,
}

impl StatementPairing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a template; returns the line to log, `None` to suppress
    pub fn on_statement(&mut self, connection: &str, sql: &str) -> Option<String> {
        if self.pending.len() >= MAX_PENDING && !self.pending.contains_key(connection) {
            self.pending.clear();
        }

        if is_setup_probe(sql) {
            self.pending
                .insert(connection.to_string(), Pending::Suppressed);
            return None;
        }
        if !is_loggable(sql) {
            self.pending.remove(connection);
            return Some(sql.to_string());
        }

        let normalized = normalize(sql);
        let line = format!("SQL Query: {normalized}");
        self.pending
            .insert(connection.to_string(), Pending::Template(normalized));
        Some(line)
    }

    /// Combine parameters with the connection's pending template
    pub fn on_parameters(&mut self, connection: &str, dump: &str) -> Option<String> {
        match self.pending.remove(connection) {
            Some(Pending::Template(template)) => Some(format!(
                "SQL Executed: {}",
                combine_with_dump(&template, dump)
            )),
            Some(Pending::Suppressed) => None,
            None => Some(format!("SQL Parameters: {}", dump_body(dump))),
        }
    }

    /// Number of templates still waiting for parameters
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        Self::Int(v.into())
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f32> for SqlValue {
    fn from(v: f32) -> Self {
        Self::Float(v.into())
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        Self::Text(v.clone())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Other(v.to_rfc3339())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl From<&serde_json::Value> for SqlValue {
    fn from(v: &serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or_else(|| Self::Other(n.to_string())),
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Other(other.to_string()),
        }
    }
}
