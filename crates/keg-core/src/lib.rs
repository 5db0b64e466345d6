//! Core domain model for the keg artifact store.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Parametric hash values and their textual encodings
//! - Content-address variants and the reference-set model
//! - Store paths and the path-naming algebra
//! - Derivations, their canonical text, and the hash-modulo identity
//! - Valid-path metadata and signature fingerprints

pub mod content_address;
pub mod derivation;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod path_info;
pub mod peer;
pub mod store_path;

pub use content_address::{
    ContentAddress, ContentAddressWithReferences, FixedOutputInfo, IngestionMethod,
    PathReferences, PeerInfo, TextInfo,
};
pub use derivation::{
    hash_derivation_modulo, hash_placeholder, Derivation, DerivationKind, DerivationOutput,
    DrvHashContext, DrvHashModulo,
};
pub use error::{Error, Result};
pub use hash::{Algorithm, Hash, HashEncoding, Hasher};
pub use path_info::{Signature, ValidPathInfo};
pub use peer::PeerRef;
pub use store_path::{StoreDir, StorePath, StorePathHash, StorePathName, DEFAULT_STORE_DIR};

/// File extension of serialized derivations.
pub const DRV_EXTENSION: &str = ".drv";
