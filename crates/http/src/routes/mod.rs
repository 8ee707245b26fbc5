//! API route definitions
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::state::AppState;

pub mod health;
pub mod users;

#[derive(OpenApi)]
#[openapi(
    components(
        schemas(crate::error::ErrorResponse)
    ),
    tags(
        (name = "health", description = "Service health and information"),
        (name = "users", description = "User management endpoints"),
    ),
)]
struct ApiDoc;

/// All routes with their OpenAPI description
pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::with_openapi(ApiDoc::openapi())
        .merge(health::router())
        .nest("/api/v1", users::router())
}
