//! Error types for workq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("processing {id} failed: {message}")]
    Process { id: String, message: String },

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("no scheduled task registered under {0:?}")]
    UnknownTask(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build an [`Error::Panicked`] from a task join failure.
    pub(crate) fn from_join(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Error::Panicked(message)
        } else {
            Error::Other(format!("task cancelled: {err}"))
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
