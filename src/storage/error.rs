//! Storage error types.

use std::fmt;

/// Errors that can occur against a storage backend.
#[derive(Debug)]
pub enum StorageError {
    /// IO error
    Io(std::io::Error),
    /// Serialization error
    Serialize(String),
    /// Deserialization error (corrupt or foreign record)
    Deserialize(String),
    /// Backend-reported error
    Backend(String),
    /// Backend unreachable; the specific operation failed, the router stays up
    Unavailable(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Serialize(e) => write!(f, "serialization error: {}", e),
            Self::Deserialize(e) => write!(f, "deserialization error: {}", e),
            Self::Backend(e) => write!(f, "storage error: {}", e),
            Self::Unavailable(e) => write!(f, "backend unavailable: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<fjall::Error> for StorageError {
    fn from(err: fjall::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialize(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Deserialize(err.to_string())
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::Backend(err.to_string())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialize(err.to_string())
        } else {
            Self::Serialize(err.to_string())
        }
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
