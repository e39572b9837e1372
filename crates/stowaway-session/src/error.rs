//! Error types for persistent session management.
//!
//! A missing session is never an error: lookups return `Ok(None)`. Errors are
//! reserved for failures of the durable store and for rejected requests.

/// Error type for session manager and store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The store medium failed (disk, socket, ...).
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific store failure that is not a plain I/O error.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A persisted snapshot could not be reconstructed.
    #[error("Failed to deserialize session {id}: {message}")]
    Deserialization { id: String, message: String },

    /// A session could not be encoded for the store.
    #[error("Failed to serialize session {id}: {message}")]
    Serialization { id: String, message: String },

    /// The session id cannot be used as a store key.
    #[error("Invalid session id: {0:?}")]
    InvalidId(String),

    /// A session with this id is already resident.
    #[error("Duplicate session id: {0}")]
    DuplicateId(String),

    /// Creating another session would exceed the configured maximum.
    #[error("Too many active sessions (max {max})")]
    TooManyActiveSessions { max: usize },
}

impl Error {
    /// Whether the error indicates corrupted persisted data.
    ///
    /// Corruption is escalated to the caller and never retried within the
    /// same call; every other store failure is recoverable.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Deserialization { .. })
    }

    /// Whether the error came from the store medium.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Persistence(_)
                | Error::Serialization { .. }
                | Error::InvalidId(_)
        )
    }
}

/// Result type for session manager operations.
pub type Result<T> = std::result::Result<T, Error>;
