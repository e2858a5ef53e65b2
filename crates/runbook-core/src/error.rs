use crate::types::PermissionTier;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunbookError {
    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("action not found: {server}/{action}")]
    ActionNotFound { server: String, action: String },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("invalid id '{0}': must contain only letters, digits, hyphens, underscores and dots")]
    InvalidId(String),

    #[error("permission denied: requires {required}, caller has {actual}")]
    PermissionDenied {
        required: PermissionTier,
        actual: PermissionTier,
    },

    #[error("invalid permission tier: {0}")]
    InvalidTier(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("run store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RunbookError>;
