//! Application-wide error types.

use thiserror::Error;

use crate::dispatch::task::StatusCode;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("index error: {0}")]
    Index(String),

    /// Matching was attempted before any vocabulary was configured.
    #[error("entity configuration error: {0}")]
    EntityConfiguration(String),

    /// A relation row already exists for this entity id.
    #[error("relation for eid {eid} already exists; clear the index before re-indexing")]
    Uniqueness { eid: i64 },

    #[error("validation error: {0}")]
    Validation(String),

    /// A store was referenced by an update before it was ever built.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Wire status code reported when this error ends a task.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BadParameter,
            AppError::Internal(_) => StatusCode::InternalError,
            _ => StatusCode::Failed,
        }
    }
}
