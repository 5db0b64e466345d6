//! Ed25519 signing for the keg artifact store.
//!
//! Signatures cover the path fingerprint (path, NAR hash, NAR size,
//! references); a destination store accepts a path if any signature verifies
//! against its trusted key set, or if the path is self-authenticating.

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::{KeyPair, PublicKey, SecretKey, TrustedKeys};
pub use signer::{count_valid_signatures, verify_any, verify_signature, StoreSigner};
