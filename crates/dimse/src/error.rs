//! Error types for DIMSE operations

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Could not associate with {peer}: {message}")]
    Association { peer: String, message: String },

    #[error("No valid Query/Retrieve Information Model for {0} could be selected")]
    NoValidInformationModel(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected error during {operation} [{status:#06x}]")]
    OperationFailed { operation: String, status: u16 },

    #[error("All {failed} sub-operations failed")]
    AllSubOperationsFailed { failed: u32 },

    #[error("{failures} C-STORE operation(s) failed")]
    StoreFailed { failures: usize },

    #[error("{count} DICOM file(s) could not be read for C-STORE")]
    UnreadableDicomFiles { count: usize },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the error is caused by a transient condition and the whole
    /// operation may be retried later. The connector never retries DIMSE
    /// operations itself, the scheduling layer decides based on this flag.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_)
                | DimseError::Association { .. }
                | DimseError::Protocol(_)
                | DimseError::OperationFailed { .. }
                | DimseError::AllSubOperationsFailed { .. }
                | DimseError::StoreFailed { .. }
                | DimseError::Timeout(_)
        )
    }
}
