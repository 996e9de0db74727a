//! Local durable key/value storage.
//!
//! The offline queue buffers pending operations here so they survive a
//! restart of the client.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for key/value storage backends.
///
/// Implementations can store values in memory, on the filesystem, or in
/// browser local storage.
pub trait KeyValueStorage: Send + Sync {
    /// Store a value, replacing any previous one.
    fn put(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Load a value.
    fn get(&self, key: &str) -> StorageResult<String>;

    /// Delete a value. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// List all keys.
    fn keys(&self) -> StorageResult<Vec<String>>;

    /// Check if a key exists.
    fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
