//! Registry error types.

use thiserror::Error;

/// Errors from the persistent registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reference '{0}' is not a valid path")]
    MissingReference(String),

    #[error("path '{0}' is still referenced and cannot be deleted")]
    PathInUse(String),

    #[error("registry row is corrupt: {0}")]
    Corrupt(String),
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

impl From<RegistryError> for keg_core::Error {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Corrupt(msg) => keg_core::Error::Format(msg),
            RegistryError::Io(e) => keg_core::Error::Io(e),
            other => keg_core::Error::Other(other.to_string()),
        }
    }
}
