//! HTTP error types and implementations

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use roster_core::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HTTP-specific errors
///
/// These pass through the request middleware untouched; they are turned into
/// a JSON body here, inside the handler's span and correlation scope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// Resource not found
    #[error("{0}")]
    NotFound(String),

    /// Bad request
    #[error("{0}")]
    BadRequest(String),

    /// Conflict with existing data
    #[error("{0}")]
    Conflict(String),

    /// Request data failed validation
    #[error("{0}")]
    Validation(String),

    /// Internal server error
    #[error("{0}")]
    InternalServerError(String),
}

impl HttpError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::Conflict(_) => StatusCode::CONFLICT,
            HttpError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HttpError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code sent as `error_code`
    pub fn error_code(&self) -> &'static str {
        match self {
            HttpError::NotFound(_) => "NOT_FOUND",
            HttpError::BadRequest(_) => "BAD_REQUEST",
            HttpError::Conflict(_) => "CONFLICT",
            HttpError::Validation(_) => "VALIDATION_ERROR",
            HttpError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(detail) => HttpError::NotFound(detail),
            StoreError::Conflict(detail) => HttpError::Conflict(detail),
            StoreError::Validation(detail) => HttpError::Validation(detail),
            StoreError::Backend(detail) => {
                tracing::error!(error = %detail, "Storage backend failure");
                HttpError::InternalServerError("Internal server error".to_string())
            }
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub detail: String,
    pub error_code: String,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            detail: self.to_string(),
            error_code: self.error_code().to_string(),
        };

        tracing::error!(
            error_code = %body.error_code,
            detail = %body.detail,
            status_code = status.as_u16(),
            "Custom exception occurred"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias using HttpError
pub type Result<T> = std::result::Result<T, HttpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_status() {
        let cases = [
            (StoreError::NotFound("gone".into()), StatusCode::NOT_FOUND, "NOT_FOUND"),
            (StoreError::Conflict("dup".into()), StatusCode::CONFLICT, "CONFLICT"),
            (
                StoreError::Validation("bad".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
            ),
            (
                StoreError::Backend("pool closed".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
            ),
        ];

        for (store_error, status, code) in cases {
            let err = HttpError::from(store_error);
            assert_eq!(err.status_code(), status);
            assert_eq!(err.error_code(), code);
        }
    }

    #[test]
    fn test_backend_detail_is_not_leaked() {
        let err = HttpError::from(StoreError::Backend("password=hunter2".into()));
        assert_eq!(err.to_string(), "Internal server error");
    }

    #[tokio::test]
    async fn test_error_body() {
        let response = HttpError::NotFound("User not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["detail"], "User not found");
        assert_eq!(json["error_code"], "NOT_FOUND");
    }
}
