//! Query-execution notifications
//!
//! Every statement the store runs is announced on the SQL log target before
//! it is sent to the database. The log formatter turns these notifications
//! into the executable statement, so sqlx's own statement logging is
//! switched off to keep each statement to one line.
//!
//! Two shapes exist. A combined notification carries the statement and its
//! parameters together; the paired form announces the statement and then its
//! parameters as two events on the same connection, the way a driver that
//! reports them separately would.

use roster_core::tracing::sql::{SQL_TARGET, SqlParams, SqlValue};
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::{Query, QueryAs};

/// Statement and parameters announced together
pub fn executed(statement: &str, params: &SqlParams) {
    tracing::event!(
        target: SQL_TARGET,
        tracing::Level::INFO,
        "sql.statement" = statement,
        "sql.params" = %params.to_json(),
        "SQL Executed"
    );
}

/// First half of a paired notification
pub fn statement(connection: &str, statement: &str) {
    tracing::event!(
        target: SQL_TARGET,
        tracing::Level::INFO,
        "sql.connection" = connection,
        "sql.statement" = statement,
        "SQL Query"
    );
}

/// Second half of a paired notification, `dump` as rendered by the driver
pub fn parameters(connection: &str, dump: &str) {
    tracing::event!(
        target: SQL_TARGET,
        tracing::Level::INFO,
        "sql.connection" = connection,
        "sql.parameters" = dump,
        "SQL Parameters"
    );
}

/// A statement with its positional parameters
///
/// Binding and logging go through the same values, so what is logged is
/// exactly what ran.
#[derive(Debug, Clone)]
pub struct Statement {
    sql: String,
    params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append the next `$n` parameter
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> SqlParams {
        SqlParams::Positional(self.params.clone())
    }

    /// Announce as a combined notification
    pub fn log(&self) {
        executed(&self.sql, &self.params());
    }

    /// Announce as a paired notification on `connection`
    pub fn log_on(&self, connection: &str) {
        statement(connection, &self.sql);
        parameters(connection, &self.params().to_string());
    }

    pub fn query(&self) -> Query<'_, Postgres, PgArguments> {
        self.params
            .iter()
            .fold(sqlx::query(&self.sql), |query, value| match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Bool(b) => query.bind(*b),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Text(s) | SqlValue::Other(s) => query.bind(s.as_str()),
            })
    }

    pub fn query_as<O>(&self) -> QueryAs<'_, Postgres, O, PgArguments>
    where
        O: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow>,
    {
        self.params
            .iter()
            .fold(sqlx::query_as(&self.sql), |query, value| match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Bool(b) => query.bind(*b),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Text(s) | SqlValue::Other(s) => query.bind(s.as_str()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::tracing::sql::reconstruct;

    #[test]
    fn test_statement_collects_params_in_order() {
        let statement = Statement::new("SELECT * FROM users WHERE email = $1 AND is_active = $2")
            .bind("o'brien@example.com")
            .bind(true);

        assert_eq!(
            statement.params(),
            SqlParams::Positional(vec![
                SqlValue::Text("o'brien@example.com".to_string()),
                SqlValue::Bool(true),
            ])
        );
        assert_eq!(
            reconstruct(statement.sql(), &statement.params()).unwrap(),
            "SELECT * FROM users WHERE email = 'o''brien@example.com' AND is_active = TRUE"
        );
    }

    fn formatted(f: impl FnOnce()) -> Vec<String> {
        use roster_core::tracing::format::{EventFormatter, StandardFormatter};
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct Lines(Arc<Mutex<Vec<u8>>>);

        impl std::io::Write for Lines {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let lines = Lines::default();
        let writer = lines.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .event_format(EventFormatter::new(Arc::new(StandardFormatter::plain())))
            .finish();
        tracing::subscriber::with_default(subscriber, f);

        let bytes = lines.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_combined_notification_reaches_formatter() {
        let lines = formatted(|| {
            Statement::new("SELECT id FROM users WHERE email = $1")
                .bind("ada@example.com")
                .log();
        });
        assert_eq!(lines.len(), 1);
        assert!(
            lines[0].ends_with("SELECT id FROM users WHERE email = 'ada@example.com'"),
            "{lines:?}"
        );
    }

    #[test]
    fn test_paired_notification_reaches_formatter() {
        let lines = formatted(|| {
            Statement::new("UPDATE users SET bio = $1 WHERE id = $2")
                .bind(r"C:\new\bio")
                .bind(1_i64)
                .log_on("conn-1");
        });
        assert_eq!(lines.len(), 2, "{lines:?}");
        assert!(lines[0].ends_with("SQL Query: UPDATE users SET bio = $1 WHERE id = $2"));
        assert!(
            lines[1].ends_with(r"SQL Executed: UPDATE users SET bio = 'C:\new\bio' WHERE id = 1"),
            "{lines:?}"
        );
    }

    #[test]
    fn test_optional_values_bind_as_null() {
        let statement = Statement::new("UPDATE users SET bio = $1 WHERE id = $2")
            .bind(None::<String>)
            .bind(7_i64);
        assert_eq!(
            reconstruct(statement.sql(), &statement.params()).unwrap(),
            "UPDATE users SET bio = NULL WHERE id = 7"
        );
    }
}
