//! Store path types and the path-naming algebra.
//!
//! A store path is `<store-dir>/<hash-part>-<name>`. The hash part is the
//! registry's primary key: 32 base-32 characters derived from a 20-byte
//! digest. Path synthesis (the `make_*` constructors on [`StoreDir`]) hashes
//! a typed fingerprint so that paths of different provenance can never
//! collide.

use crate::content_address::{
    ContentAddress, ContentAddressWithReferences, FixedOutputInfo, IngestionMethod, TextInfo,
};
use crate::encoding;
use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash, HashEncoding};
use crate::peer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The conventional store directory.
pub const DEFAULT_STORE_DIR: &str = "/nix/store";

/// Size of the folded path digest in bytes.
pub const STORE_PATH_HASH_BYTES: usize = 20;

/// Length of the hash part in base-32 characters.
pub const STORE_PATH_HASH_CHARS: usize = 32;

/// Maximum length of a printed store path in bytes.
pub const MAX_STORE_PATH_LEN: usize = 211;

/// The 32-character hash part of a store path.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorePathHash(String);

impl StorePathHash {
    /// Validate a 32-character base-32 string.
    pub fn new(hash: impl Into<String>) -> Result<Self> {
        let hash = hash.into();
        if hash.len() != STORE_PATH_HASH_CHARS {
            return Err(Error::Format(format!(
                "store path hash part must be {STORE_PATH_HASH_CHARS} chars, got {}",
                hash.len()
            )));
        }
        for c in hash.bytes() {
            if !encoding::NIX32_ALPHABET.contains(&c) {
                return Err(Error::Format(format!(
                    "invalid character '{}' in store path hash part",
                    c as char
                )));
            }
        }
        Ok(Self(hash))
    }

    /// Encode a folded 20-byte digest.
    pub fn from_digest(digest: &[u8]) -> Result<Self> {
        if digest.len() != STORE_PATH_HASH_BYTES {
            return Err(Error::Format(format!(
                "store path digest must be {STORE_PATH_HASH_BYTES} bytes, got {}",
                digest.len()
            )));
        }
        Ok(Self(encoding::nix32_encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePathHash({self})")
    }
}

impl fmt::Display for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The human-readable name component of a store path.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorePathName(String);

impl StorePathName {
    /// Validate a name: non-empty, `[A-Za-z0-9+\-_?=.]` only.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Format("store path name is empty".into()));
        }
        for c in name.chars() {
            if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '+' | '-' | '_' | '?' | '=' | '.') {
                return Err(Error::Format(format!(
                    "invalid character '{c}' in store path name '{name}'"
                )));
            }
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePathName({self})")
    }
}

/// A store path: hash part plus name. Equality is componentwise; the hash
/// part alone is the registry key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorePath {
    hash: StorePathHash,
    name: StorePathName,
}

impl StorePath {
    pub fn new(hash: StorePathHash, name: StorePathName) -> Self {
        Self { hash, name }
    }

    /// Parse a `<hash>-<name>` basename.
    pub fn from_basename(basename: &str) -> Result<Self> {
        if !basename.is_ascii() {
            return Err(Error::Format(format!(
                "store path '{basename}' contains non-ASCII characters"
            )));
        }
        if basename.len() < STORE_PATH_HASH_CHARS + 2 {
            return Err(Error::Format(format!("store path '{basename}' is too short")));
        }
        let (hash_part, rest) = basename.split_at(STORE_PATH_HASH_CHARS);
        let name = rest
            .strip_prefix('-')
            .ok_or_else(|| Error::Format(format!("expected '-' after hash part in '{basename}'")))?;
        Ok(Self {
            hash: StorePathHash::new(hash_part)?,
            name: StorePathName::new(name)?,
        })
    }

    pub fn hash_part(&self) -> &StorePathHash {
        &self.hash
    }

    pub fn name(&self) -> &StorePathName {
        &self.name
    }

    /// The `<hash>-<name>` basename.
    pub fn basename(&self) -> String {
        format!("{}-{}", self.hash, self.name)
    }

    /// Whether the name carries the derivation extension.
    pub fn is_derivation(&self) -> bool {
        self.name.as_str().ends_with(crate::DRV_EXTENSION)
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePath({})", self.basename())
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.basename())
    }
}

/// The store directory, and with it the whole path-naming algebra.
///
/// Printed paths embed the directory, so two stores with different
/// directories assign different paths to identical content.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDir(String);

impl Default for StoreDir {
    fn default() -> Self {
        Self(DEFAULT_STORE_DIR.to_string())
    }
}

impl StoreDir {
    /// Validate a store directory: absolute, no trailing slash.
    pub fn new(dir: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        if !dir.starts_with('/') || (dir.len() > 1 && dir.ends_with('/')) {
            return Err(Error::Format(format!("invalid store directory '{dir}'")));
        }
        Ok(Self(dir))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Print a store path with this directory prefixed.
    pub fn print_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.0, path.basename())
    }

    /// Parse a full store path string. Inverse of [`StoreDir::print_path`].
    pub fn parse_path(&self, s: &str) -> Result<StorePath> {
        let rest = s
            .strip_prefix(&self.0)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| Error::Format(format!("path '{s}' is not in store directory {}", self.0)))?;
        if rest.contains('/') {
            return Err(Error::Format(format!("path '{s}' has extra components")));
        }
        if s.len() > MAX_STORE_PATH_LEN {
            return Err(Error::Format(format!(
                "store path '{s}' exceeds {MAX_STORE_PATH_LEN} bytes"
            )));
        }
        StorePath::from_basename(rest)
    }

    /// Whether `path` lies inside the store directory.
    pub fn is_in_store(&self, path: &str) -> bool {
        path.starts_with(&self.0)
            && path.len() > self.0.len()
            && path.as_bytes()[self.0.len()] == b'/'
    }

    /// Truncate a sub-path to its enclosing store path.
    pub fn to_store_path(&self, path: &str) -> Result<StorePath> {
        if !self.is_in_store(path) {
            return Err(Error::NotInStore(path.to_string()));
        }
        let rest = &path[self.0.len() + 1..];
        let base = rest.split('/').next().unwrap_or(rest);
        StorePath::from_basename(base)
    }

    /// Print every path in a set, lexicographically.
    pub fn print_path_set(&self, paths: &BTreeSet<StorePath>) -> Vec<String> {
        let mut out: Vec<String> = paths.iter().map(|p| self.print_path(p)).collect();
        out.sort();
        out
    }

    /// Synthesize a store path from a typed fingerprint.
    ///
    /// The fingerprint is `<type>:<algo>:<base16 hash>:<store dir>:<name>`;
    /// its SHA-256 is XOR-folded to 20 bytes and rendered in base-32.
    pub fn make_store_path(&self, type_: &str, hash: &Hash, name: &StorePathName) -> Result<StorePath> {
        let fingerprint = format!(
            "{}:{}:{}:{}",
            type_,
            hash.to_text(HashEncoding::Base16, true),
            self.0,
            name
        );
        self.make_store_path_raw(&fingerprint, name)
    }

    fn make_store_path_raw(&self, fingerprint: &str, name: &StorePathName) -> Result<StorePath> {
        let folded = Hash::of(Algorithm::Sha256, fingerprint.as_bytes()).compress(STORE_PATH_HASH_BYTES);
        let path = StorePath::new(StorePathHash::from_digest(&folded)?, name.clone());
        let printed_len = self.0.len() + 1 + path.basename().len();
        if printed_len > MAX_STORE_PATH_LEN {
            return Err(Error::Format(format!(
                "store path for '{name}' would be {printed_len} bytes, limit is {MAX_STORE_PATH_LEN}"
            )));
        }
        Ok(path)
    }

    /// Path of a derivation output. Outputs other than `out` get the output
    /// id appended to the name.
    pub fn make_output_path(&self, id: &str, hash: &Hash, name: &StorePathName) -> Result<StorePath> {
        let name = if id == "out" {
            name.clone()
        } else {
            StorePathName::new(format!("{name}-{id}"))?
        };
        self.make_store_path(&format!("output:{id}"), hash, &name)
    }

    /// Stuff references (and the self marker) into the fingerprint type.
    fn make_type(
        &self,
        base: &str,
        references: &BTreeSet<StorePath>,
        has_self_reference: bool,
    ) -> String {
        let mut type_ = base.to_string();
        for reference in references {
            type_.push(':');
            type_.push_str(&self.print_path(reference));
        }
        if has_self_reference {
            type_.push_str(":self");
        }
        type_
    }

    /// Path of a text artifact (e.g. a derivation file).
    pub fn make_text_path(&self, name: &StorePathName, info: &TextInfo) -> Result<StorePath> {
        if info.hash.algorithm() != Algorithm::Sha256 {
            return Err(Error::Format("text path hash must be SHA-256".into()));
        }
        self.make_store_path(&self.make_type("text", &info.references, false), &info.hash, name)
    }

    /// Path of a fixed-output artifact.
    ///
    /// Recursive SHA-256 ingestion supports references and uses the `source`
    /// type; every other combination must be reference-free and goes through
    /// the inner `fixed:out:` hash.
    pub fn make_fixed_output_path(
        &self,
        name: &StorePathName,
        info: &FixedOutputInfo,
    ) -> Result<StorePath> {
        if info.method == IngestionMethod::Git && info.hash.algorithm() != Algorithm::Sha1 {
            return Err(Error::Format("git ingestion requires a SHA-1 hash".into()));
        }
        if info.hash.algorithm() == Algorithm::Sha256 && info.method == IngestionMethod::Recursive {
            self.make_store_path(
                &self.make_type(
                    "source",
                    &info.references.references,
                    info.references.has_self_reference,
                ),
                &info.hash,
                name,
            )
        } else {
            if !info.references.references.is_empty() || info.references.has_self_reference {
                return Err(Error::Format(
                    "non-source fixed-output paths cannot carry references".into(),
                ));
            }
            let inner = format!(
                "fixed:out:{}{}:",
                info.method.prefix(),
                info.hash.to_text(HashEncoding::Base16, true)
            );
            let hash = Hash::of(Algorithm::Sha256, inner.as_bytes());
            self.make_store_path("output:out", &hash, name)
        }
    }

    /// Path of a peer-network object. The fingerprint carries the textual
    /// CID instead of a bare hash.
    pub fn make_peer_path(&self, name: &StorePathName, hash: &Hash) -> Result<StorePath> {
        let cid = peer::cid_text(hash)?;
        let fingerprint = format!("ipfs:{}:{}:{}", cid, self.0, name);
        self.make_store_path_raw(&fingerprint, name)
    }

    /// Bake a content address (with references) into a store path.
    ///
    /// Pure: equal inputs always yield equal paths.
    pub fn make_path_from_ca(
        &self,
        name: &StorePathName,
        ca: &ContentAddressWithReferences,
    ) -> Result<StorePath> {
        match ca {
            ContentAddressWithReferences::Text(info) => self.make_text_path(name, info),
            ContentAddressWithReferences::Fixed(info) => self.make_fixed_output_path(name, info),
            ContentAddressWithReferences::Peer(info) => {
                let hash = peer::compute_peer_hash(name, info)?;
                self.make_peer_path(name, &hash)
            }
            ContentAddressWithReferences::PeerRaw(hash) => self.make_peer_path(name, hash),
        }
    }

    /// Bake a plain content address (no references) into a store path.
    pub fn make_path_from_plain_ca(&self, name: &StorePathName, ca: &ContentAddress) -> Result<StorePath> {
        self.make_path_from_ca(name, &ca.clone().with_empty_references())
    }
}

impl fmt::Debug for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreDir({})", self.0)
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
