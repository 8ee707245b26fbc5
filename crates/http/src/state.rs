//! Application state management

use std::sync::Arc;

use roster_core::UserStore;

/// Facts about the running service reported by the info endpoints
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub environment: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            name: "Roster".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Shared application state
///
/// Cloned into every handler; the store sits behind an `Arc` so the clone
/// is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Persistence for user records
    pub users: Arc<dyn UserStore>,
    pub service: Arc<ServiceInfo>,
}

impl AppState {
    /// Create a new AppState with the given components
    pub fn new(users: Arc<dyn UserStore>, service: ServiceInfo) -> Self {
        Self {
            users,
            service: Arc::new(service),
        }
    }
}
