//! Parametric cryptographic hash values.
//!
//! A [`Hash`] pairs an algorithm tag with a digest of that algorithm's native
//! size. Rendering and parsing cover the three textual encodings used across
//! the store; the encoding of a parsed string is inferred from its length.

use crate::encoding;
use crate::error::{Error, Result};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// Maximum digest size over all supported algorithms (SHA-512).
pub const MAX_DIGEST_SIZE: usize = 64;

/// Supported hash algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Digest size in bytes.
    pub const fn size(self) -> usize {
        match self {
            Algorithm::Md5 => 16,
            Algorithm::Sha1 => 20,
            Algorithm::Sha256 => 32,
            Algorithm::Sha512 => 64,
        }
    }

    /// Length of the base-16 rendering.
    pub const fn base16_len(self) -> usize {
        self.size() * 2
    }

    /// Length of the base-32 rendering.
    pub const fn base32_len(self) -> usize {
        encoding::nix32_len(self.size())
    }

    /// Length of the base-64 rendering.
    pub const fn base64_len(self) -> usize {
        (self.size() + 2) / 3 * 4
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Algorithm::Md5 => "md5",
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        })
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "md5" => Ok(Algorithm::Md5),
            "sha1" => Ok(Algorithm::Sha1),
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(Error::Format(format!("unknown hash algorithm '{s}'"))),
        }
    }
}

/// Textual encodings of a digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashEncoding {
    Base16,
    Base32,
    Base64,
}

/// A hash value: algorithm tag plus digest bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash {
    algorithm: Algorithm,
    bytes: [u8; MAX_DIGEST_SIZE],
}

impl Hash {
    /// Wrap raw digest bytes; the slice length must match the algorithm.
    pub fn from_digest(algorithm: Algorithm, digest: &[u8]) -> Result<Self> {
        if digest.len() != algorithm.size() {
            return Err(Error::Format(format!(
                "digest for {algorithm} must be {} bytes, got {}",
                algorithm.size(),
                digest.len()
            )));
        }
        let mut bytes = [0u8; MAX_DIGEST_SIZE];
        bytes[..digest.len()].copy_from_slice(digest);
        Ok(Self { algorithm, bytes })
    }

    /// Hash a byte string in one shot.
    pub fn of(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data);
        hasher.finish()
    }

    /// The algorithm tag.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The digest bytes, exactly `algorithm().size()` long.
    pub fn digest(&self) -> &[u8] {
        &self.bytes[..self.algorithm.size()]
    }

    /// XOR-fold the digest down to `n` bytes: output byte `i` is the XOR of
    /// all input bytes at positions congruent to `i` modulo `n`.
    pub fn compress(&self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        for (i, b) in self.digest().iter().enumerate() {
            out[i % n] ^= b;
        }
        out
    }

    fn render(&self, enc: HashEncoding) -> String {
        match enc {
            HashEncoding::Base16 => encoding::base16_encode(self.digest()),
            HashEncoding::Base32 => encoding::nix32_encode(self.digest()),
            HashEncoding::Base64 => encoding::base64_encode(self.digest()),
        }
    }

    /// Render in the given encoding, optionally with the `<algo>:` prefix.
    pub fn to_text(&self, enc: HashEncoding, include_algorithm: bool) -> String {
        if include_algorithm {
            format!("{}:{}", self.algorithm, self.render(enc))
        } else {
            self.render(enc)
        }
    }

    /// Bare lowercase base-16.
    pub fn to_base16(&self) -> String {
        self.render(HashEncoding::Base16)
    }

    /// Bare base-32.
    pub fn to_base32(&self) -> String {
        self.render(HashEncoding::Base32)
    }

    /// Bare base-64.
    pub fn to_base64(&self) -> String {
        self.render(HashEncoding::Base64)
    }

    /// Parse a hash, accepting an optional `<algo>:` prefix and any of the
    /// three encodings (selected by length).
    ///
    /// `expected` constrains the algorithm: a bare string is interpreted with
    /// it, and a prefixed string must agree with it.
    pub fn parse(s: &str, expected: Option<Algorithm>) -> Result<Self> {
        let (algorithm, rest) = match s.split_once(':') {
            Some((prefix, rest)) => {
                let algorithm: Algorithm = prefix.parse()?;
                if let Some(expected) = expected {
                    if algorithm != expected {
                        return Err(Error::Format(format!(
                            "hash '{s}' should have type {expected}"
                        )));
                    }
                }
                (algorithm, rest)
            }
            None => {
                let algorithm = expected.ok_or_else(|| {
                    Error::Format(format!("hash '{s}' lacks an algorithm prefix"))
                })?;
                (algorithm, s)
            }
        };

        let bytes = if rest.len() == algorithm.base16_len() {
            encoding::base16_decode(rest)?
        } else if rest.len() == algorithm.base32_len() {
            encoding::nix32_decode(rest)?
        } else if rest.len() == algorithm.base64_len() {
            encoding::base64_decode(rest)?
        } else {
            return Err(Error::Format(format!(
                "hash '{rest}' has wrong length for {algorithm}"
            )));
        };
        Self::from_digest(algorithm, &bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}:{})", self.algorithm, &self.to_base16()[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text(HashEncoding::Base32, true))
    }
}

/// Incremental hasher dispatching over the supported algorithms.
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Md5 => Hasher::Md5(Md5::new()),
            Algorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Hash {
        let (algorithm, digest) = match self {
            Hasher::Md5(h) => (Algorithm::Md5, h.finalize().to_vec()),
            Hasher::Sha1(h) => (Algorithm::Sha1, h.finalize().to_vec()),
            Hasher::Sha256(h) => (Algorithm::Sha256, h.finalize().to_vec()),
            Hasher::Sha512(h) => (Algorithm::Sha512, h.finalize().to_vec()),
        };
        let mut bytes = [0u8; MAX_DIGEST_SIZE];
        bytes[..digest.len()].copy_from_slice(&digest);
        Hash { algorithm, bytes }
    }
}
