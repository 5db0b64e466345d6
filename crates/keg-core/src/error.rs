//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
///
/// Every failure mode that callers are expected to dispatch on gets its own
/// discriminant; `Other` is the fallback for conditions nobody recovers from.
#[derive(Debug, Error)]
pub enum Error {
    /// The path is not valid in the consulted store (or negatively cached).
    #[error("path '{0}' is not valid")]
    InvalidPath(String),

    /// Malformed textual input: store path, content address, derivation, CID.
    #[error("{0}")]
    Format(String),

    /// Recomputed hash of fetched bytes differs from the expected hash.
    #[error("hash mismatch for '{path}': expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// No trusted signature and the path is not self-authenticating.
    #[error("path '{0}' lacks a valid signature")]
    Signature(String),

    /// A filesystem path escaped the store root.
    #[error("path '{0}' is not in the store")]
    NotInStore(String),

    /// The backend cannot honor the requested operation.
    #[error("operation '{0}' is not supported by this store")]
    Unsupported(&'static str),

    /// A remote peer spoke a protocol version we cannot handle.
    #[error("protocol mismatch with '{0}'")]
    ProtocolMismatch(String),

    /// Transport ended before the expected data arrived.
    #[error("unexpected end of file: {0}")]
    EndOfFile(String),

    /// The interrupt flag was raised.
    #[error("interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors that `query_valid_paths` swallows rather than re-raises.
    pub fn is_invalid_path(&self) -> bool {
        matches!(self, Error::InvalidPath(_))
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
