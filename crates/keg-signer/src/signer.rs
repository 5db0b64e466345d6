//! Fingerprint signing and verification.

use crate::error::{SignerError, SignerResult};
use crate::key::{KeyPair, PublicKey, TrustedKeys};
use base64::Engine;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier;
use keg_core::path_info::Signature;
use keg_core::store_path::StoreDir;
use keg_core::ValidPathInfo;

/// Signs path-info fingerprints with a named key.
pub struct StoreSigner {
    keypair: KeyPair,
}

impl StoreSigner {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    /// Create from a secret key string.
    pub fn from_secret_key(s: &str) -> SignerResult<Self> {
        Ok(Self::new(KeyPair::from_secret_key(s)?))
    }

    /// Generate a signer with a fresh random key.
    pub fn generate(key_name: impl Into<String>) -> Self {
        Self::new(KeyPair::generate(key_name))
    }

    pub fn key_name(&self) -> &str {
        &self.keypair.name
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// The public key disk format for distribution to verifiers.
    pub fn public_key_string(&self) -> String {
        self.keypair.to_public_key()
    }

    /// Sign the info's fingerprint and add the signature to it.
    pub fn sign(&self, store_dir: &StoreDir, info: &mut ValidPathInfo) -> keg_core::Result<()> {
        let fingerprint = info.fingerprint(store_dir)?;
        info.sigs.insert(self.sign_fingerprint(&fingerprint));
        Ok(())
    }

    /// Sign a fingerprint string.
    pub fn sign_fingerprint(&self, fingerprint: &str) -> Signature {
        let sig = self.keypair.secret.signing_key().sign(fingerprint.as_bytes());
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(sig.to_bytes());
        Signature::new(&self.keypair.name, sig_b64)
    }
}

/// Verify one signature over a fingerprint.
pub fn verify_signature(
    fingerprint: &str,
    signature: &Signature,
    public_key: &PublicKey,
) -> SignerResult<()> {
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(&signature.sig)
        .map_err(|e| SignerError::InvalidSignature(format!("invalid base64: {e}")))?;

    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| SignerError::InvalidSignature("signature must be 64 bytes".to_string()))?;

    let signature = ed25519_dalek::Signature::from_bytes(&sig_array);

    public_key
        .verifying_key()
        .verify(fingerprint.as_bytes(), &signature)
        .map_err(|_| SignerError::VerificationFailed)
}

/// Whether any of the signatures verifies against a trusted key of the same
/// name. Signatures from unknown keys are skipped, not errors.
pub fn verify_any<'a>(
    fingerprint: &str,
    sigs: impl IntoIterator<Item = &'a Signature>,
    trusted: &TrustedKeys,
) -> bool {
    sigs.into_iter().any(|sig| {
        trusted
            .get(&sig.key_name)
            .is_some_and(|key| verify_signature(fingerprint, sig, key).is_ok())
    })
}

/// Count the signatures on a path info that verify against trusted keys.
pub fn count_valid_signatures(
    store_dir: &StoreDir,
    info: &ValidPathInfo,
    trusted: &TrustedKeys,
) -> keg_core::Result<usize> {
    let fingerprint = info.fingerprint(store_dir)?;
    Ok(info
        .sigs
        .iter()
        .filter(|sig| {
            trusted
                .get(&sig.key_name)
                .is_some_and(|key| verify_signature(&fingerprint, sig, key).is_ok())
        })
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keg_core::hash::{Algorithm, Hash};
    use keg_core::store_path::StorePath;

    fn sample_info() -> ValidPathInfo {
        let path = StorePath::from_basename("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg").unwrap();
        ValidPathInfo::new(path, Hash::of(Algorithm::Sha256, b"nar"), 123)
    }

    #[test]
    fn test_sign_and_verify() {
        let store_dir = StoreDir::default();
        let signer = StoreSigner::generate("test-cache-1");

        let mut info = sample_info();
        signer.sign(&store_dir, &mut info).unwrap();

        assert_eq!(info.sigs.len(), 1);
        let sig = info.sigs.iter().next().unwrap();
        assert_eq!(sig.key_name, "test-cache-1");

        let fingerprint = info.fingerprint(&store_dir).unwrap();
        assert!(verify_signature(&fingerprint, sig, signer.public_key()).is_ok());
    }

    #[test]
    fn test_verify_with_wrong_key_fails() {
        let store_dir = StoreDir::default();
        let signer = StoreSigner::generate("key-1");
        let other = StoreSigner::generate("key-2");

        let mut info = sample_info();
        signer.sign(&store_dir, &mut info).unwrap();

        let fingerprint = info.fingerprint(&store_dir).unwrap();
        let sig = info.sigs.iter().next().unwrap();
        assert!(verify_signature(&fingerprint, sig, other.public_key()).is_err());
    }

    #[test]
    fn test_tampered_fingerprint_fails() {
        let store_dir = StoreDir::default();
        let signer = StoreSigner::generate("key-1");

        let mut info = sample_info();
        signer.sign(&store_dir, &mut info).unwrap();
        info.nar_size = 999;

        let fingerprint = info.fingerprint(&store_dir).unwrap();
        let sig = info.sigs.iter().next().unwrap();
        assert!(verify_signature(&fingerprint, sig, signer.public_key()).is_err());
    }

    #[test]
    fn test_verify_any_against_trusted_set() {
        let store_dir = StoreDir::default();
        let signer = StoreSigner::generate("trusted-1");

        let mut info = sample_info();
        signer.sign(&store_dir, &mut info).unwrap();

        let trusted =
            TrustedKeys::from_store_formats([signer.public_key_string().as_str()]).unwrap();
        let fingerprint = info.fingerprint(&store_dir).unwrap();
        assert!(verify_any(&fingerprint, &info.sigs, &trusted));

        let untrusting = TrustedKeys::new();
        assert!(!verify_any(&fingerprint, &info.sigs, &untrusting));
    }

    #[test]
    fn test_count_valid_signatures() {
        let store_dir = StoreDir::default();
        let a = StoreSigner::generate("a");
        let b = StoreSigner::generate("b");

        let mut info = sample_info();
        a.sign(&store_dir, &mut info).unwrap();
        b.sign(&store_dir, &mut info).unwrap();

        let trusted = TrustedKeys::from_store_formats([a.public_key_string().as_str()]).unwrap();
        assert_eq!(count_valid_signatures(&store_dir, &info, &trusted).unwrap(), 1);
    }
}
