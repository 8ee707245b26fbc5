//! Roster server: settings and process bootstrap for the `roster` binary

pub mod error;
pub mod settings;

pub use error::{Result, ServerError};
pub use settings::Settings;
