//! Signer error types.

use thiserror::Error;

/// Errors from key handling and signature verification.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key parsing error: {0}")]
    KeyParsing(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("signature verification failed")]
    VerificationFailed,
}

/// Result type for signer operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;

impl From<SignerError> for keg_core::Error {
    fn from(e: SignerError) -> Self {
        match e {
            SignerError::KeyParsing(msg) => keg_core::Error::Format(msg),
            SignerError::InvalidSignature(msg) => keg_core::Error::Format(msg),
            SignerError::VerificationFailed => {
                keg_core::Error::Signature("signature verification failed".into())
            }
        }
    }
}
