//! User management endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use roster_core::{ListQuery, NewUser, User, UserUpdate};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::{error::HttpError, state::AppState};

/// Upper bound for `per_page`
pub const MAX_PER_PAGE: u64 = 100;

/// User representation returned by the API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
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

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        UserResponse {
            id: user.id,
            email: user.email,
            username: user.username,
            full_name: user.full_name,
            bio: user.bio,
            avatar_url: user.avatar_url,
            is_active: user.is_active,
            is_superuser: user.is_superuser,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
}

impl From<CreateUserRequest> for NewUser {
    fn from(request: CreateUserRequest) -> Self {
        NewUser {
            email: request.email,
            username: request.username,
            full_name: request.full_name,
            bio: request.bio,
            avatar_url: request.avatar_url,
        }
    }
}

/// Fields left out are not changed
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub is_active: Option<bool>,
}

impl From<UpdateUserRequest> for UserUpdate {
    fn from(request: UpdateUserRequest) -> Self {
        UserUpdate {
            email: request.email,
            username: request.username,
            full_name: request.full_name,
            bio: request.bio,
            avatar_url: request.avatar_url,
            is_active: request.is_active,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListUsersQuery {
    /// Page number, starting at 1
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
    /// Return only active users
    #[serde(default)]
    pub active_only: bool,
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    20
}

impl ListUsersQuery {
    fn to_list_query(&self) -> Result<ListQuery, HttpError> {
        if self.page < 1 {
            return Err(HttpError::BadRequest(
                "Page number must be greater than 0".to_string(),
            ));
        }
        if self.per_page < 1 {
            return Err(HttpError::BadRequest(
                "Items per page must be greater than 0".to_string(),
            ));
        }
        if self.per_page > MAX_PER_PAGE {
            return Err(HttpError::BadRequest(format!(
                "Items per page cannot exceed {MAX_PER_PAGE}"
            )));
        }

        Ok(ListQuery {
            skip: (self.page - 1).saturating_mul(self.per_page),
            limit: self.per_page,
            active_only: self.active_only,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserListResponse {
    pub users: Vec<UserResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub pages: u64,
}

fn user_not_found() -> HttpError {
    HttpError::NotFound("User not found".to_string())
}

/// Create a user
#[utoipa::path(
    post,
    path = "/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = UserResponse),
        (status = 409, description = "Email or username already in use", body = crate::error::ErrorResponse),
        (status = 422, description = "Validation error", body = crate::error::ErrorResponse),
    ),
    tag = "users"
)]
#[instrument(name = "create_user", skip_all, fields(user_id = tracing::field::Empty))]
pub async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), HttpError> {
    let new_user = NewUser::from(request);
    new_user.validate()?;

    let user = state.users.create(&new_user).await?;
    tracing::Span::current().record("user_id", user.id);
    tracing::info!(user_id = user.id, username = %user.username, "User created");

    Ok((StatusCode::CREATED, Json(user.into())))
}

/// List users page by page
#[utoipa::path(
    get,
    path = "/users",
    params(ListUsersQuery),
    responses(
        (status = 200, description = "Page of users", body = UserListResponse),
        (status = 400, description = "Invalid paging parameters", body = crate::error::ErrorResponse),
    ),
    tag = "users"
)]
#[instrument(name = "list_users", skip(state))]
pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<UserListResponse>, HttpError> {
    let list_query = query.to_list_query()?;

    let users = state.users.list(list_query).await?;
    let total = state.users.count(query.active_only).await?;

    Ok(Json(UserListResponse {
        users: users.into_iter().map(UserResponse::from).collect(),
        total,
        page: query.page,
        per_page: query.per_page,
        pages: total.div_ceil(query.per_page),
    }))
}

/// Get a user by ID
#[utoipa::path(
    get,
    path = "/users/{id}",
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "User found", body = UserResponse),
        (status = 404, description = "User not found", body = crate::error::ErrorResponse),
    ),
    tag = "users"
)]
#[instrument(name = "get_user", skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<UserResponse>, HttpError> {
    let user = state.users.get(id).await?.ok_or_else(user_not_found)?;
    Ok(Json(user.into()))
}

/// Update a user
#[utoipa::path(
    put,
    path = "/users/{id}",
    params(("id" = i64, Path, description = "User ID")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "User updated", body = UserResponse),
        (status = 404, description = "User not found", body = crate::error::ErrorResponse),
        (status = 409, description = "Email or username already in use", body = crate::error::ErrorResponse),
        (status = 422, description = "Validation error", body = crate::error::ErrorResponse),
    ),
    tag = "users"
)]
#[instrument(name = "update_user", skip(state, request))]
pub async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, HttpError> {
    let update = UserUpdate::from(request);
    update.validate()?;

    let user = state
        .users
        .update(id, &update)
        .await?
        .ok_or_else(user_not_found)?;
    tracing::info!(user_id = user.id, changed = update.changes().len(), "User updated");

    Ok(Json(user.into()))
}

/// Delete a user
#[utoipa::path(
    delete,
    path = "/users/{id}",
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "User deleted", body = UserResponse),
        (status = 404, description = "User not found", body = crate::error::ErrorResponse),
    ),
    tag = "users"
)]
#[instrument(name = "delete_user", skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<UserResponse>, HttpError> {
    let user = state.users.delete(id).await?.ok_or_else(user_not_found)?;
    tracing::info!(user_id = user.id, "User deleted");
    Ok(Json(user.into()))
}

/// Create the user routes router
pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(create_user, list_users))
        .routes(routes!(get_user, update_user, delete_user))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(page: u64, per_page: u64) -> ListUsersQuery {
        ListUsersQuery {
            page,
            per_page,
            active_only: false,
        }
    }

    #[test]
    fn test_paging_translates_to_skip_and_limit() {
        let list = query(3, 20).to_list_query().unwrap();
        assert_eq!(list.skip, 40);
        assert_eq!(list.limit, 20);
    }

    #[test]
    fn test_paging_bounds() {
        assert!(matches!(query(0, 20).to_list_query(), Err(HttpError::BadRequest(_))));
        assert!(matches!(query(1, 0).to_list_query(), Err(HttpError::BadRequest(_))));
        assert!(matches!(
            query(1, MAX_PER_PAGE + 1).to_list_query(),
            Err(HttpError::BadRequest(_))
        ));
        assert!(query(1, MAX_PER_PAGE).to_list_query().is_ok());
    }
}
