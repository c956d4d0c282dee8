/// Error types for nettables operations.
///
/// Local API misuse (bad handles, type conflicts) is reported synchronously
/// through these variants. Network faults are never returned to unrelated
/// publishers; the network layer logs them and raises connection events
/// instead.
use thiserror::Error;

/// The main error type for nettables operations.
#[derive(Error, Debug)]
pub enum TableError {
    /// A value or publisher does not match the topic's bound type
    #[error("Type mismatch on topic '{topic}': bound to {expected}, got {actual}")]
    TypeMismatch {
        /// The topic name
        topic: String,
        /// The type the topic is bound to
        expected: String,
        /// The type that was offered
        actual: String,
    },

    /// A released, stale, or foreign handle was used
    #[error("Invalid handle: {handle}")]
    HandleInvalid {
        /// Display form of the offending handle
        handle: String,
    },

    /// An update was not newer than the stored value
    #[error("Stale update for topic '{topic}'")]
    StaleUpdate {
        /// The topic name
        topic: String,
    },

    /// A peer sent a malformed or unexpected message
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The transport to a peer failed
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data format or structure
    #[error("Invalid data: {reason}")]
    InvalidData {
        /// Description of why the data is invalid
        reason: String,
    },

    /// Persistence file could not be written or read
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// The network role is already running on this instance
    #[error("Network already running")]
    AlreadyRunning,
}

impl TableError {
    pub(crate) fn invalid_handle(handle: impl std::fmt::Display) -> Self {
        TableError::HandleInvalid {
            handle: handle.to_string(),
        }
    }

    pub(crate) fn invalid_data(reason: impl Into<String>) -> Self {
        TableError::InvalidData {
            reason: reason.into(),
        }
    }
}

/// Result type alias for nettables operations.
pub type TableResult<T> = Result<T, TableError>;
