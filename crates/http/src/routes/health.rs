//! Health check and service information handlers

use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub environment: String,
    pub version: String,
}

/// Service information response
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RootResponse {
    pub message: String,
    pub version: String,
    pub docs: String,
    pub health: String,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    tracing::debug!("Health check requested");
    Json(HealthResponse {
        status: "healthy".to_string(),
        environment: state.service.environment.clone(),
        version: state.service.version.clone(),
    })
}

/// Root endpoint with API information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = RootResponse)
    ),
    tag = "health"
)]
pub async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    tracing::info!("Root endpoint accessed");
    Json(RootResponse {
        message: format!("Welcome to {}", state.service.name),
        version: state.service.version.clone(),
        docs: "/docs".to_string(),
        health: "/health".to_string(),
    })
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(health_check))
        .routes(routes!(root))
}
