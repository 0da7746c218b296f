//! Error types for vigil-storage
//!
//! This module defines the error types used throughout the storage crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store path does not exist and creation was not requested
    #[error("File doesn't exist: {}", .0.display())]
    FileDoesntExist(PathBuf),

    /// The directory or archive is missing the database or the manifest
    #[error("Store is invalid: {0}")]
    StoreInvalid(String),

    /// The store was written by a version older than the minimum supported one
    #[error("Unsupported store version {version} (minimum supported {minimum})")]
    UnsupportedVersion { version: String, minimum: String },

    /// Export destination is already taken
    #[error("File already exists: {}", .0.display())]
    FileAlreadyExists(PathBuf),

    /// Mutation attempted on a read-only store or archive
    #[error("Store is read-only")]
    ReadOnly,

    /// The write context has shut down
    #[error("Store is closed")]
    Closed,

    /// I/O error during storage operations
    #[error("I/O error: {0}")]
    Io(String),

    /// Record engine error
    #[error("Database error: {0}")]
    Database(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Archive packing or unpacking failed
    #[error("Archive error: {0}")]
    Archive(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested item was not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Create a new NotFound error
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    /// Create a new StoreInvalid error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::StoreInvalid(message.into())
    }

    /// Create a new Archive error
    pub fn archive(message: impl Into<String>) -> Self {
        Self::Archive(message.into())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            StorageError::Io(err.to_string())
        } else {
            StorageError::Deserialization(err.to_string())
        }
    }
}

macro_rules! database_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StorageError {
                fn from(err: $ty) -> Self {
                    StorageError::Database(err.to_string())
                }
            }
        )*
    };
}

database_error!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Result alias for store operations
pub type StorageResult<T> = Result<T, StorageError>;
