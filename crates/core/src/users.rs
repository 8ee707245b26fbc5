//! User domain types and the persistence boundary
//!
//! [`UserStore`] is implemented by the PostgreSQL backend and by
//! [`MemoryUserStore`], which keeps everything in process.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::tracing::sql::SqlValue;

/// Errors raised by user stores
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data for registering a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl NewUser {
    pub fn validate(&self) -> StoreResult<()> {
        validate_email(&self.email)?;
        validate_username(&self.username)?;
        validate_profile(self.full_name.as_deref(), self.bio.as_deref())
    }
}

/// Partial update; `None` leaves a column untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub is_active: Option<bool>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        self.changes().is_empty()
    }

    pub fn validate(&self) -> StoreResult<()> {
        if let Some(email) = &self.email {
            validate_email(email)?;
        }
        if let Some(username) = &self.username {
            validate_username(username)?;
        }
        validate_profile(self.full_name.as_deref(), self.bio.as_deref())
    }

    /// Columns set by this update with their new values, in column order
    pub fn changes(&self) -> Vec<(&'static str, SqlValue)> {
        let text = |column, value: &Option<String>| {
            value.as_ref().map(|v| (column, SqlValue::from(v)))
        };
        [
            text("email", &self.email),
            text("username", &self.username),
            text("full_name", &self.full_name),
            text("bio", &self.bio),
            text("avatar_url", &self.avatar_url),
            self.is_active.map(|v| ("is_active", SqlValue::from(v))),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn apply(&self, user: &mut User) {
        if let Some(email) = &self.email {
            user.email.clone_from(email);
        }
        if let Some(username) = &self.username {
            user.username.clone_from(username);
        }
        if let Some(full_name) = &self.full_name {
            user.full_name = Some(full_name.clone());
        }
        if let Some(bio) = &self.bio {
            user.bio = Some(bio.clone());
        }
        if let Some(avatar_url) = &self.avatar_url {
            user.avatar_url = Some(avatar_url.clone());
        }
        if let Some(is_active) = self.is_active {
            user.is_active = is_active;
        }
    }
}

fn validate_email(email: &str) -> StoreResult<()> {
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if valid && !email.chars().any(char::is_whitespace) {
        Ok(())
    } else {
        Err(StoreError::Validation(format!("Invalid email address: {email}")))
    }
}

fn validate_username(username: &str) -> StoreResult<()> {
    match username.chars().count() {
        3..=50 => Ok(()),
        _ => Err(StoreError::Validation(
            "Username must be between 3 and 50 characters".to_string(),
        )),
    }
}

fn validate_profile(full_name: Option<&str>, bio: Option<&str>) -> StoreResult<()> {
    if full_name.is_some_and(|n| n.chars().count() > 100) {
        return Err(StoreError::Validation(
            "Full name must be at most 100 characters".to_string(),
        ));
    }
    if bio.is_some_and(|b| b.chars().count() > 1000) {
        return Err(StoreError::Validation(
            "Bio must be at most 1000 characters".to_string(),
        ));
    }
    Ok(())
}

/// Paging and filtering for [`UserStore::list`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    pub skip: u64,
    pub limit: u64,
    pub active_only: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: 20,
            active_only: false,
        }
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create(&self, user: &NewUser) -> StoreResult<User>;
    async fn get(&self, id: i64) -> StoreResult<Option<User>>;
    async fn list(&self, query: ListQuery) -> StoreResult<Vec<User>>;
    async fn count(&self, active_only: bool) -> StoreResult<u64>;
    async fn update(&self, id: i64, update: &UserUpdate) -> StoreResult<Option<User>>;
    async fn delete(&self, id: i64) -> StoreResult<Option<User>>;
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>>;
}

/// In-process store, used when no database is configured
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    inner: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    users: BTreeMap<i64, User>,
}

impl MemoryState {
    fn taken(&self, except: Option<i64>, email: Option<&str>, username: Option<&str>) -> StoreResult<()> {
        for user in self.users.values().filter(|u| Some(u.id) != except) {
            if email.is_some_and(|e| e == user.email) {
                return Err(StoreError::Conflict("Email already registered".to_string()));
            }
            if username.is_some_and(|n| n == user.username) {
                return Err(StoreError::Conflict("Username already taken".to_string()));
            }
        }
        Ok(())
    }
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, user: &NewUser) -> StoreResult<User> {
        let mut state = self.inner.write().await;
        state.taken(None, Some(&user.email), Some(&user.username))?;

        state.next_id += 1;
        let now = Utc::now();
        let created = User {
            id: state.next_id,
            email: user.email.clone(),
            username: user.username.clone(),
            full_name: user.full_name.clone(),
            bio: user.bio.clone(),
            avatar_url: user.avatar_url.clone(),
            is_active: true,
            is_superuser: false,
            created_at: now,
            updated_at: now,
        };
        state.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn list(&self, query: ListQuery) -> StoreResult<Vec<User>> {
        let state = self.inner.read().await;
        Ok(state
            .users
            .values()
            .filter(|u| !query.active_only || u.is_active)
            .skip(usize::try_from(query.skip).unwrap_or(usize::MAX))
            .take(usize::try_from(query.limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn count(&self, active_only: bool) -> StoreResult<u64> {
        let state = self.inner.read().await;
        Ok(state
            .users
            .values()
            .filter(|u| !active_only || u.is_active)
            .count() as u64)
    }

    async fn update(&self, id: i64, update: &UserUpdate) -> StoreResult<Option<User>> {
        let mut state = self.inner.write().await;
        if !state.users.contains_key(&id) {
            return Ok(None);
        }
        state.taken(Some(id), update.email.as_deref(), update.username.as_deref())?;

        let Some(user) = state.users.get_mut(&id) else {
            return Ok(None);
        };
        if !update.is_empty() {
            update.apply(user);
            user.updated_at = Utc::now();
        }
        Ok(Some(user.clone()))
    }

    async fn delete(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.inner.write().await.users.remove(&id))
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let state = self.inner.read().await;
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let state = self.inner.read().await;
        Ok(state.users.values().find(|u| u.username == username).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::users::UserStoreTestSuite;

    #[tokio::test]
    async fn test_memory_store_conformance() {
        UserStoreTestSuite::new(MemoryUserStore::new())
            .run_all_tests()
            .await
            .unwrap();
    }

    #[test]
    fn test_update_changes_are_explicit() {
        let update = UserUpdate {
            full_name: Some("Jane Doe".to_string()),
            is_active: Some(false),
            ..UserUpdate::default()
        };
        assert_eq!(
            update.changes(),
            vec![
                ("full_name", SqlValue::Text("Jane Doe".to_string())),
                ("is_active", SqlValue::Bool(false)),
            ]
        );
        assert!(UserUpdate::default().is_empty());
    }

    #[test]
    fn test_validation() {
        let user = NewUser {
            email: "jane@example.com".to_string(),
            username: "jane".to_string(),
            full_name: None,
            bio: None,
            avatar_url: None,
        };
        assert!(user.validate().is_ok());

        let bad_email = NewUser {
            email: "not-an-email".to_string(),
            ..user.clone()
        };
        assert!(matches!(bad_email.validate(), Err(StoreError::Validation(_))));

        let short_name = NewUser {
            username: "jo".to_string(),
            ..user
        };
        assert!(matches!(short_name.validate(), Err(StoreError::Validation(_))));

        let update = UserUpdate {
            bio: Some("x".repeat(1001)),
            ..UserUpdate::default()
        };
        assert!(update.validate().is_err());
    }
}
