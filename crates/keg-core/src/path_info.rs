//! Metadata about a valid store path.

use crate::content_address::{
    ContentAddress, ContentAddressWithReferences, FixedOutputInfo, PathReferences, TextInfo,
};
use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash};
use crate::store_path::{StoreDir, StorePath};
use std::collections::BTreeSet;
use std::fmt;

/// A detached signature over a path fingerprint: key name plus base-64 bytes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Signature {
    pub key_name: String,
    pub sig: String,
}

impl Signature {
    pub fn new(key_name: impl Into<String>, sig: impl Into<String>) -> Self {
        Self { key_name: key_name.into(), sig: sig.into() }
    }

    /// Parse from `keyname:base64` form.
    pub fn parse(s: &str) -> Result<Self> {
        let (key_name, sig) = s
            .split_once(':')
            .ok_or_else(|| Error::Format(format!("invalid signature '{s}'")))?;
        Ok(Self::new(key_name, sig))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_name, self.sig)
    }
}

/// Everything the registry knows about a valid path.
///
/// Immutable once registered; `references` never contains the path itself,
/// the self edge lives in the `has_self_reference` flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidPathInfo {
    pub path: StorePath,
    pub deriver: Option<StorePath>,
    /// SHA-256 of the canonical tree serialization.
    pub nar_hash: Hash,
    pub nar_size: u64,
    pub references: PathReferences<StorePath>,
    /// Unix seconds at registration.
    pub registration_time: i64,
    /// Built locally rather than substituted.
    pub ultimate: bool,
    pub sigs: BTreeSet<Signature>,
    pub ca: Option<ContentAddress>,
}

impl ValidPathInfo {
    /// A fresh record with no references or signatures.
    pub fn new(path: StorePath, nar_hash: Hash, nar_size: u64) -> Self {
        Self {
            path,
            deriver: None,
            nar_hash,
            nar_size,
            references: PathReferences::default(),
            registration_time: 0,
            ultimate: false,
            sigs: BTreeSet::new(),
            ca: None,
        }
    }

    /// Build path info for `name` from a content address, baking the path.
    pub fn from_ca(
        store_dir: &StoreDir,
        name: &crate::store_path::StorePathName,
        ca: ContentAddressWithReferences,
        nar_hash: Hash,
        nar_size: u64,
    ) -> Result<Self> {
        let path = store_dir.make_path_from_ca(name, &ca)?;
        let mut info = ValidPathInfo::new(path, nar_hash, nar_size);
        match ca {
            ContentAddressWithReferences::Text(text) => {
                info.references.references = text.references;
                info.ca = Some(ContentAddress::Text(text.hash));
            }
            ContentAddressWithReferences::Fixed(fixed) => {
                info.references = fixed.references.clone();
                info.ca = Some(ContentAddress::Fixed { method: fixed.method, hash: fixed.hash });
            }
            ContentAddressWithReferences::Peer(peer_info) => {
                info.references.has_self_reference = peer_info.references.has_self_reference;
                for reference in &peer_info.references.references {
                    info.references
                        .references
                        .insert(store_dir.make_peer_path(&reference.name, &reference.hash)?);
                }
                info.ca = Some(ContentAddress::Peer(crate::peer::compute_peer_hash(
                    name, &peer_info,
                )?));
            }
            ContentAddressWithReferences::PeerRaw(_) => {
                return Err(Error::Other(
                    "cannot make a valid path from a raw peer hash without fetching the object".into(),
                ))
            }
        }
        Ok(info)
    }

    /// The references with the self edge flattened back in.
    pub fn references_possibly_to_self(&self) -> BTreeSet<StorePath> {
        self.references.possibly_to_self(&self.path)
    }

    /// Insert a reference, diverting the path itself into the self flag.
    pub fn insert_reference_possibly_to_self(&mut self, reference: StorePath) {
        let self_path = self.path.clone();
        self.references.insert_possibly_self(&self_path, reference);
    }

    /// Replace references from a flattened set.
    pub fn set_references_possibly_to_self(&mut self, refs: BTreeSet<StorePath>) {
        let self_path = self.path.clone();
        self.references.set_possibly_self(&self_path, refs);
    }

    /// The canonical string a path signature covers:
    /// `1;<path>;sha256:<base32 nar hash>;<nar size>;<refs joined by comma>`.
    pub fn fingerprint(&self, store_dir: &StoreDir) -> Result<String> {
        if self.nar_size == 0 {
            return Err(Error::Other(format!(
                "cannot calculate fingerprint of '{}' because its size is not known",
                store_dir.print_path(&self.path)
            )));
        }
        let references = self.references_possibly_to_self();
        Ok(format!(
            "1;{};sha256:{};{};{}",
            store_dir.print_path(&self.path),
            self.nar_hash.to_base32(),
            self.nar_size,
            store_dir.print_path_set(&references).join(",")
        ))
    }

    /// Recover the full content address, or `None` for input-addressed paths.
    pub fn full_content_address(&self) -> Result<Option<ContentAddressWithReferences>> {
        let ca = match &self.ca {
            None => return Ok(None),
            Some(ca) => ca,
        };
        Ok(Some(match *ca {
            ContentAddress::Text(hash) => {
                if self.references.has_self_reference {
                    return Err(Error::Format(format!(
                        "text path '{}' may not reference itself",
                        self.path
                    )));
                }
                ContentAddressWithReferences::Text(TextInfo {
                    hash,
                    references: self.references.references.clone(),
                })
            }
            ContentAddress::Fixed { method, hash } => {
                ContentAddressWithReferences::Fixed(FixedOutputInfo {
                    method,
                    hash,
                    references: self.references.clone(),
                })
            }
            // peer references cannot be reconstructed from store paths alone
            ContentAddress::Peer(hash) => ContentAddressWithReferences::PeerRaw(hash),
        }))
    }

    /// Whether the path is verifiably derived from its content address.
    /// Such paths are self-authenticating and need no signature.
    pub fn is_content_addressed(&self, store_dir: &StoreDir) -> Result<bool> {
        let ca = match self.full_content_address()? {
            None => return Ok(false),
            Some(ca) => ca,
        };
        let baked = store_dir.make_path_from_ca(self.path.name(), &ca)?;
        Ok(baked == self.path)
    }

    /// Render the textual form used by binary-cache backends.
    pub fn to_text(&self, store_dir: &StoreDir) -> String {
        let mut lines = Vec::new();
        lines.push(format!("StorePath: {}", store_dir.print_path(&self.path)));
        lines.push(format!("NarHash: sha256:{}", self.nar_hash.to_base32()));
        lines.push(format!("NarSize: {}", self.nar_size));

        let references = self.references_possibly_to_self();
        if !references.is_empty() {
            let basenames: Vec<_> = references.iter().map(StorePath::basename).collect();
            lines.push(format!("References: {}", basenames.join(" ")));
        }
        if let Some(deriver) = &self.deriver {
            lines.push(format!("Deriver: {}", deriver.basename()));
        }
        if self.registration_time != 0 {
            lines.push(format!("RegistrationTime: {}", self.registration_time));
        }
        if self.ultimate {
            lines.push("Ultimate: true".to_string());
        }
        for sig in &self.sigs {
            lines.push(format!("Sig: {sig}"));
        }
        if let Some(ca) = &self.ca {
            lines.push(format!("CA: {}", ca.render()));
        }
        lines.join("\n") + "\n"
    }

    /// Parse the textual form. Unknown keys are ignored.
    pub fn parse_text(store_dir: &StoreDir, text: &str) -> Result<Self> {
        let mut path = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = Vec::new();
        let mut deriver = None;
        let mut registration_time = 0i64;
        let mut ultimate = false;
        let mut sigs = BTreeSet::new();
        let mut ca = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| Error::Format(format!("invalid path info line '{line}'")))?;
            match key {
                "StorePath" => path = Some(store_dir.parse_path(value)?),
                "NarHash" => nar_hash = Some(Hash::parse(value, Some(Algorithm::Sha256))?),
                "NarSize" => {
                    nar_size = Some(value.parse::<u64>().map_err(|e| {
                        Error::Format(format!("invalid NarSize '{value}': {e}"))
                    })?)
                }
                "References" => {
                    for basename in value.split_whitespace() {
                        references.push(StorePath::from_basename(basename)?);
                    }
                }
                "Deriver" => deriver = Some(StorePath::from_basename(value)?),
                "RegistrationTime" => {
                    registration_time = value.parse().map_err(|e| {
                        Error::Format(format!("invalid RegistrationTime '{value}': {e}"))
                    })?
                }
                "Ultimate" => ultimate = value == "true",
                "Sig" => {
                    sigs.insert(Signature::parse(value)?);
                }
                "CA" => ca = ContentAddress::parse_opt(value)?,
                _ => {}
            }
        }

        let path = path.ok_or_else(|| Error::Format("path info is missing StorePath".into()))?;
        let nar_hash =
            nar_hash.ok_or_else(|| Error::Format("path info is missing NarHash".into()))?;
        let nar_size =
            nar_size.ok_or_else(|| Error::Format("path info is missing NarSize".into()))?;

        let mut info = ValidPathInfo::new(path, nar_hash, nar_size);
        info.set_references_possibly_to_self(references.into_iter().collect());
        info.deriver = deriver;
        info.registration_time = registration_time;
        info.ultimate = ultimate;
        info.sigs = sigs;
        info.ca = ca;
        Ok(info)
    }
}
