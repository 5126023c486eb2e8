// Error types shared by every public operation in the crate
//
// Each public call returns either a value or exactly one CoreError. Library
// failures are mapped here at the boundary.

use thiserror::Error;

use crate::crypto::primitives::CryptoError;

/// Coarse error category, stable across versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NetworkError,
    FileError,
    EncryptionError,
    PermissionDenied,
    DatabaseError,
    InvalidOperation,
    UnknownError,
}

/// Errors returned by the messaging session, the transfer engine and the crypto service
#[derive(Debug, Error)]
pub enum CoreError {
    /// Connection, socket or channel failure
    #[error("Network error: {0}")]
    Network(String),

    /// Missing file, unreadable file, short read
    #[error("File error: {0}")]
    File(String),

    /// Key handling, encryption, decryption or signature failure
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// No valid grant for the requested access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Checkpoint or permission table failure
    #[error("Database error: {0}")]
    Database(String),

    /// Operation not valid in the current state, or unknown id
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Anything that does not fit the categories above
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Network(_) => ErrorKind::NetworkError,
            CoreError::File(_) => ErrorKind::FileError,
            CoreError::Encryption(_) => ErrorKind::EncryptionError,
            CoreError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            CoreError::Database(_) => ErrorKind::DatabaseError,
            CoreError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            CoreError::Unknown(_) => ErrorKind::UnknownError,
        }
    }

    /// Shorthand for the "no such id" flavour of InvalidOperation
    pub fn not_found(what: &str, id: &str) -> Self {
        CoreError::InvalidOperation(format!("{} not found: {}", what, id))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::File(e.to_string())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Database(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CoreError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CoreError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Unknown(format!("JSON error: {}", e))
    }
}

impl From<CryptoError> for CoreError {
    fn from(e: CryptoError) -> Self {
        CoreError::Encryption(e.to_string())
    }
}
