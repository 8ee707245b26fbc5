//! PostgreSQL implementation of UserStore

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roster_core::{ListQuery, NewUser, StoreError, StoreResult, User, UserStore, UserUpdate};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{ConnectOptions, FromRow};
use tracing::instrument;

use crate::sql_log::Statement;

const USER_COLUMNS: &str = "id, email, username, full_name, bio, avatar_url, is_active, is_superuser, created_at, updated_at";

#[derive(FromRow)]
struct UserRow {
    id: i64,
    email: String,
    username: String,
    full_name: Option<String>,
    bio: Option<String>,
    avatar_url: Option<String>,
    is_active: bool,
    is_superuser: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            username: row.username,
            full_name: row.full_name,
            bio: row.bio,
            avatar_url: row.avatar_url,
            is_active: row.is_active,
            is_superuser: row.is_superuser,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn store_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return match db.constraint() {
                Some(constraint) if constraint.contains("email") => {
                    StoreError::Conflict("Email already registered".to_string())
                }
                _ => StoreError::Conflict("Username already taken".to_string()),
            };
        }
    }
    StoreError::Backend(format!("Database error: {err}"))
}

/// UserStore over a PostgreSQL pool
#[derive(Debug)]
pub struct PgUserStore {
    pool: PgPool,
    transactions: AtomicU64,
}

impl PgUserStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            transactions: AtomicU64::new(0),
        }
    }

    /// Connect with sqlx's own statement logging disabled
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(store_error)?
            .disable_statement_logging();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(store_error)?;
        Ok(Self::from_pool(pool))
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Migration failed: {e}")))
    }

    /// Version string reported by the server
    pub async fn server_version(&self) -> StoreResult<String> {
        let statement = Statement::new("select pg_catalog.version()");
        statement.log();
        let (version,): (String,) = statement
            .query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(version)
    }

    async fn fetch_user(&self, statement: Statement) -> StoreResult<Option<User>> {
        statement.log();
        let row: Option<UserRow> = statement
            .query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.map(Into::into))
    }

    async fn is_taken(&self, column: &str, value: &str, except: Option<i64>) -> StoreResult<bool> {
        let statement = Statement::new(format!(
            "SELECT id FROM users WHERE {column} = $1 AND id <> $2"
        ))
        .bind(value)
        .bind(except.unwrap_or(0));
        statement.log();
        let row: Option<(i64,)> = statement
            .query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    #[instrument(name = "db.create_user", skip_all)]
    async fn create(&self, user: &NewUser) -> StoreResult<User> {
        if self.is_taken("email", &user.email, None).await? {
            tracing::warn!("Attempt to create user with existing email");
            return Err(StoreError::Conflict("Email already registered".to_string()));
        }
        if self.is_taken("username", &user.username, None).await? {
            tracing::warn!(username = %user.username, "Attempt to create user with existing username");
            return Err(StoreError::Conflict("Username already taken".to_string()));
        }

        let statement = Statement::new(format!(
            "INSERT INTO users (email, username, full_name, bio, avatar_url) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        ))
        .bind(user.email.as_str())
        .bind(user.username.as_str())
        .bind(user.full_name.as_deref())
        .bind(user.bio.as_deref())
        .bind(user.avatar_url.as_deref());

        statement.log();
        let row: UserRow = statement
            .query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.into())
    }

    #[instrument(name = "db.get_user", skip(self))]
    async fn get(&self, id: i64) -> StoreResult<Option<User>> {
        self.fetch_user(
            Statement::new(format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1")).bind(id),
        )
        .await
    }

    #[instrument(name = "db.list_users", skip(self))]
    async fn list(&self, query: ListQuery) -> StoreResult<Vec<User>> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(query.skip).unwrap_or(i64::MAX);
        let statement = if query.active_only {
            Statement::new(format!(
                "SELECT {USER_COLUMNS} FROM users WHERE is_active = $1 ORDER BY id LIMIT $2 OFFSET $3"
            ))
            .bind(true)
        } else {
            Statement::new(format!(
                "SELECT {USER_COLUMNS} FROM users ORDER BY id LIMIT $1 OFFSET $2"
            ))
        }
        .bind(limit)
        .bind(offset);

        statement.log();
        let rows: Vec<UserRow> = statement
            .query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(name = "db.count_users", skip(self))]
    async fn count(&self, active_only: bool) -> StoreResult<u64> {
        let statement = if active_only {
            Statement::new("SELECT COUNT(*) FROM users WHERE is_active = $1").bind(true)
        } else {
            Statement::new("SELECT COUNT(*) FROM users")
        };

        statement.log();
        let (count,): (i64,) = statement
            .query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Runs in one transaction; its statements are announced as paired
    /// notifications on a connection label of their own
    #[instrument(name = "db.update_user", skip(self, update))]
    async fn update(&self, id: i64, update: &UserUpdate) -> StoreResult<Option<User>> {
        let connection = format!(
            "tx-{}",
            self.transactions.fetch_add(1, Ordering::Relaxed) + 1
        );
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let lock = Statement::new(format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(id);
        lock.log_on(&connection);
        let current: Option<UserRow> = lock
            .query_as()
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?;
        let Some(current) = current else {
            return Ok(None);
        };

        let changes = update.changes();
        if changes.is_empty() {
            return Ok(Some(current.into()));
        }

        for (column, value) in [("email", &update.email), ("username", &update.username)] {
            let Some(value) = value else { continue };
            let check = Statement::new(format!(
                "SELECT id FROM users WHERE {column} = $1 AND id <> $2"
            ))
            .bind(value.as_str())
            .bind(id);
            check.log_on(&connection);
            let taken: Option<(i64,)> = check
                .query_as()
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_error)?;
            if taken.is_some() {
                return Err(StoreError::Conflict(match column {
                    "email" => "Email already registered".to_string(),
                    _ => "Username already taken".to_string(),
                }));
            }
        }

        let assignments: Vec<String> = changes
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{column} = ${}", i + 1))
            .collect();
        let statement = changes.into_iter().fold(
            Statement::new(format!(
                "UPDATE users SET {}, updated_at = NOW() WHERE id = ${} RETURNING {USER_COLUMNS}",
                assignments.join(", "),
                assignments.len() + 1
            )),
            |statement, (_, value)| statement.bind(value),
        );
        let statement = statement.bind(id);

        statement.log_on(&connection);
        let row: UserRow = statement
            .query_as()
            .fetch_one(&mut *tx)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;

        Ok(Some(row.into()))
    }

    #[instrument(name = "db.delete_user", skip(self))]
    async fn delete(&self, id: i64) -> StoreResult<Option<User>> {
        self.fetch_user(
            Statement::new(format!(
                "DELETE FROM users WHERE id = $1 RETURNING {USER_COLUMNS}"
            ))
            .bind(id),
        )
        .await
    }

    #[instrument(name = "db.find_user_by_email", skip_all)]
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.fetch_user(
            Statement::new(format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
                .bind(email),
        )
        .await
    }

    #[instrument(name = "db.find_user_by_username", skip(self))]
    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        self.fetch_user(
            Statement::new(format!(
                "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
            ))
            .bind(username),
        )
        .await
    }
}
