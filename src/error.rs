use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Shell not found: {0}")]
    ShellNotFound(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
