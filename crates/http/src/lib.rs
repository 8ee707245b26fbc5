//! Roster HTTP module providing router and middleware functionality
//!
//! The request correlation middleware lives in [`middleware`]; [`routes`]
//! holds the handlers and their OpenAPI description, and [`server`] puts the
//! two together.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

pub use error::{HttpError, Result};
pub use middleware::TraceIdConfig;
pub use server::{build_router, serve};
pub use state::{AppState, ServiceInfo};

// Re-export commonly used types
pub use axum::{Json, extract, response};
pub use utoipa::OpenApi;
