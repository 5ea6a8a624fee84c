//! Error types of the transfer engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors of the orchestration layer.
///
/// The retry taxonomy: connector errors keep their own classification,
/// everything else raised here is fatal for the current task. The worker
/// decides requeue-with-backoff versus task failure based on
/// [`Error::is_retriable`].
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Dimse(#[from] dimse::DimseError),

    #[error("{0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Task {0} already has a queued entry")]
    TaskAlreadyQueued(u64),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    /// Create a fatal task error (ambiguous patient, invalid node, ...)
    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether the failed task should be requeued with backoff
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Dimse(err) => err.is_retriable(),
            _ => false,
        }
    }
}
