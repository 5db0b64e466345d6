//! Ed25519 key types and the on-disk key format.
//!
//! Keys are stored as `keyname:base64(payload)`: 64 bytes (secret followed
//! by public) for secret keys, 32 bytes for public keys. The key name ties a
//! signature to the trusted-key entry that can verify it.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

/// A secret (private) key for signing.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            inner: SigningKey::generate(&mut rng),
        }
    }

    /// Parse from `keyname:base64(secret || public)`.
    pub fn from_store_format(s: &str) -> SignerResult<(String, Self)> {
        let (name, b64) = s.split_once(':').ok_or_else(|| {
            SignerError::KeyParsing("expected 'keyname:base64' format".to_string())
        })?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| SignerError::KeyParsing(format!("invalid base64: {e}")))?;

        if bytes.len() != 64 {
            return Err(SignerError::KeyParsing(format!(
                "expected 64 bytes, got {}",
                bytes.len()
            )));
        }

        let secret_bytes: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| SignerError::KeyParsing("invalid secret key bytes".to_string()))?;

        Ok((name.to_string(), Self { inner: SigningKey::from_bytes(&secret_bytes) }))
    }

    /// Encode as `keyname:base64(secret || public)`.
    pub fn to_store_format(&self, key_name: &str) -> String {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.inner.as_bytes());
        bytes.extend_from_slice(self.inner.verifying_key().as_bytes());
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        format!("{key_name}:{b64}")
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// A public key for verification.
#[derive(Clone)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse from `keyname:base64(public)`.
    pub fn from_store_format(s: &str) -> SignerResult<(String, Self)> {
        let (name, b64) = s.split_once(':').ok_or_else(|| {
            SignerError::KeyParsing("expected 'keyname:base64' format".to_string())
        })?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| SignerError::KeyParsing(format!("invalid base64: {e}")))?;

        if bytes.len() != 32 {
            return Err(SignerError::KeyParsing(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let key_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignerError::KeyParsing("invalid public key bytes".to_string()))?;

        let inner = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| SignerError::KeyParsing(format!("invalid public key: {e}")))?;

        Ok((name.to_string(), Self { inner }))
    }

    /// Encode as `keyname:base64(public)`.
    pub fn to_store_format(&self, key_name: &str) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(self.inner.as_bytes());
        format!("{key_name}:{b64}")
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.inner
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = base64::engine::general_purpose::STANDARD.encode(self.inner.as_bytes());
        write!(f, "PublicKey({}...)", &b64[..8])
    }
}

/// A named key pair.
pub struct KeyPair {
    /// The key name (e.g. "cache.example.org-1").
    pub name: String,
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new key pair with the given name.
    pub fn generate(name: impl Into<String>) -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self {
            name: name.into(),
            secret,
            public,
        }
    }

    /// Parse from the secret key disk format.
    pub fn from_secret_key(s: &str) -> SignerResult<Self> {
        let (name, secret) = SecretKey::from_store_format(s)?;
        let public = secret.public_key();
        Ok(Self { name, secret, public })
    }

    /// The secret key disk format.
    pub fn to_secret_key(&self) -> String {
        self.secret.to_store_format(&self.name)
    }

    /// The public key disk format.
    pub fn to_public_key(&self) -> String {
        self.public.to_store_format(&self.name)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .field("public", &self.public)
            .finish()
    }
}

/// A set of trusted public keys, looked up by name.
#[derive(Clone, Debug, Default)]
pub struct TrustedKeys {
    keys: Vec<(String, PublicKey)>,
}

impl TrustedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a list of `keyname:base64` public key strings.
    pub fn from_store_formats<'a>(keys: impl IntoIterator<Item = &'a str>) -> SignerResult<Self> {
        let mut out = Self::new();
        for key in keys {
            let (name, public) = PublicKey::from_store_format(key)?;
            out.keys.push((name, public));
        }
        Ok(out)
    }

    pub fn insert(&mut self, name: impl Into<String>, key: PublicKey) {
        self.keys.push((name.into(), key));
    }

    pub fn get(&self, name: &str) -> Option<&PublicKey> {
        self.keys
            .iter()
            .find(|(key_name, _)| key_name == name)
            .map(|(_, key)| key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let keypair = KeyPair::generate("test-key-1");
        assert_eq!(keypair.name, "test-key-1");
    }

    #[test]
    fn test_secret_key_roundtrip() {
        let keypair = KeyPair::generate("test-key-1");
        let encoded = keypair.to_secret_key();

        let parsed = KeyPair::from_secret_key(&encoded).unwrap();
        assert_eq!(parsed.name, keypair.name);
        assert_eq!(
            parsed.public.inner.as_bytes(),
            keypair.public.inner.as_bytes()
        );
    }

    #[test]
    fn test_public_key_roundtrip() {
        let keypair = KeyPair::generate("test-key-1");
        let encoded = keypair.to_public_key();

        let (name, public) = PublicKey::from_store_format(&encoded).unwrap();
        assert_eq!(name, keypair.name);
        assert_eq!(public.inner.as_bytes(), keypair.public.inner.as_bytes());
    }

    #[test]
    fn test_trusted_keys_lookup_by_name() {
        let a = KeyPair::generate("key-a");
        let b = KeyPair::generate("key-b");
        let trusted =
            TrustedKeys::from_store_formats([a.to_public_key().as_str(), b.to_public_key().as_str()])
                .unwrap();
        assert!(trusted.get("key-a").is_some());
        assert!(trusted.get("key-b").is_some());
        assert!(trusted.get("key-c").is_none());
    }
}
