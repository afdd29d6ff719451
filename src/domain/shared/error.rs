//! Engine errors

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation already in progress: {0}")]
    Concurrency(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rejected by remote party: {0}")]
    RemoteRejection(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Operation canceled: {0}")]
    Canceled(String),
}

impl ClientError {
    /// True for cancellations, which callers treat as a normal outcome
    /// rather than a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ClientError::Canceled(_))
    }
}
