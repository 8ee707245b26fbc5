use roster_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Invalid trace header name '{0}'")]
    InvalidTraceHeader(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
