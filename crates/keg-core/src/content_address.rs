//! Content-address variants and their stable textual form.
//!
//! The "mini" [`ContentAddress`] is what gets persisted in the registry's
//! `ca` column; [`ContentAddressWithReferences`] is the richer shape used
//! when registering or baking a path.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash, HashEncoding};
use crate::peer::{self, PeerRef};
use crate::store_path::StorePath;
use std::collections::BTreeSet;
use std::fmt;

/// How raw bytes are folded into a single digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IngestionMethod {
    /// Hash of the file content.
    Flat,
    /// Hash of the canonical tree serialization.
    Recursive,
    /// Git tree-object hashing (SHA-1).
    Git,
}

impl IngestionMethod {
    /// The prefix stuffed before the hash algorithm in textual forms.
    pub fn prefix(self) -> &'static str {
        match self {
            IngestionMethod::Flat => "",
            IngestionMethod::Recursive => "r:",
            IngestionMethod::Git => "git:",
        }
    }
}

/// A content address without reference information.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentAddress {
    /// A text artifact, hashed flat with SHA-256.
    Text(Hash),
    /// A fixed-output artifact.
    Fixed { method: IngestionMethod, hash: Hash },
    /// An object in the content-addressed peer network.
    Peer(Hash),
}

impl ContentAddress {
    /// Render to the stable textual form persisted in the registry.
    pub fn render(&self) -> String {
        match self {
            ContentAddress::Text(hash) => {
                format!("text:{}", hash.to_text(HashEncoding::Base16, true))
            }
            ContentAddress::Fixed { method, hash } => format!(
                "fixed:{}{}",
                method.prefix(),
                hash.to_text(HashEncoding::Base16, true)
            ),
            ContentAddress::Peer(hash) => match peer::cid_text(hash) {
                Ok(cid) => format!("ipfs:{cid}"),
                // unreachable for a well-formed Peer hash (always SHA-256)
                Err(_) => String::from("ipfs:"),
            },
        }
    }

    /// Parse the textual form. Strictly prefix-driven; unknown prefixes fail.
    pub fn parse(s: &str) -> Result<Self> {
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::Format(format!("'{s}' is not a content address")))?;
        match prefix {
            "text" => {
                let hash = Hash::parse(rest, None)?;
                if hash.algorithm() != Algorithm::Sha256 {
                    return Err(Error::Format(format!(
                        "text content address '{s}' must use SHA-256"
                    )));
                }
                Ok(ContentAddress::Text(hash))
            }
            "fixed" => {
                let (method, hash_raw) = if let Some(r) = rest.strip_prefix("r:") {
                    (IngestionMethod::Recursive, r)
                } else if let Some(r) = rest.strip_prefix("git:") {
                    (IngestionMethod::Git, r)
                } else {
                    (IngestionMethod::Flat, rest)
                };
                Ok(ContentAddress::Fixed {
                    method,
                    hash: Hash::parse(hash_raw, None)?,
                })
            }
            "ipfs" => Ok(ContentAddress::Peer(peer::parse_cid_text(rest)?)),
            _ => Err(Error::Format(format!(
                "content address prefix '{prefix}' not recognized"
            ))),
        }
    }

    /// Parse an optional textual form; the empty string is `None`.
    pub fn parse_opt(s: &str) -> Result<Option<Self>> {
        if s.is_empty() {
            Ok(None)
        } else {
            Self::parse(s).map(Some)
        }
    }

    /// Render an optional content address; `None` is the empty string.
    pub fn render_opt(ca: &Option<Self>) -> String {
        ca.as_ref().map(Self::render).unwrap_or_default()
    }

    /// Lift to the with-references form with an empty reference set.
    pub fn with_empty_references(self) -> ContentAddressWithReferences {
        match self {
            ContentAddress::Text(hash) => ContentAddressWithReferences::Text(TextInfo {
                hash,
                references: BTreeSet::new(),
            }),
            ContentAddress::Fixed { method, hash } => {
                ContentAddressWithReferences::Fixed(FixedOutputInfo {
                    method,
                    hash,
                    references: PathReferences::default(),
                })
            }
            ContentAddress::Peer(hash) => ContentAddressWithReferences::PeerRaw(hash),
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A reference set plus an explicit self-reference flag.
///
/// The path's own identity depends on whether it references itself, so self
/// can never live inside the set: it is carried out-of-band until the path
/// has been computed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathReferences<R: Ord> {
    pub references: BTreeSet<R>,
    pub has_self_reference: bool,
}

impl<R: Ord> Default for PathReferences<R> {
    fn default() -> Self {
        Self {
            references: BTreeSet::new(),
            has_self_reference: false,
        }
    }
}

impl<R: Ord + Clone> PathReferences<R> {
    /// View references and the self flag as one flattened set.
    pub fn possibly_to_self(&self, self_ref: &R) -> BTreeSet<R> {
        let mut refs = self.references.clone();
        if self.has_self_reference {
            refs.insert(self_ref.clone());
        }
        refs
    }

    /// Insert a reference, diverting `self_ref` into the flag.
    pub fn insert_possibly_self(&mut self, self_ref: &R, reference: R) {
        if &reference == self_ref {
            self.has_self_reference = true;
        } else {
            self.references.insert(reference);
        }
    }

    /// Replace the set from a flattened one, extracting `self_ref`.
    pub fn set_possibly_self(&mut self, self_ref: &R, mut refs: BTreeSet<R>) {
        if refs.remove(self_ref) {
            self.has_self_reference = true;
        }
        self.references = refs;
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty() && !self.has_self_reference
    }
}

/// Text hash plus references. Self-reference is forbidden for text paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextInfo {
    pub hash: Hash,
    pub references: BTreeSet<StorePath>,
}

/// Fixed-output hash plus references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedOutputInfo {
    pub method: IngestionMethod,
    pub hash: Hash,
    pub references: PathReferences<StorePath>,
}

/// Peer-network object hash plus peer references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub hash: Hash,
    pub references: PathReferences<PeerRef>,
}

/// A content address together with the references needed to bake a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentAddressWithReferences {
    Text(TextInfo),
    Fixed(FixedOutputInfo),
    Peer(PeerInfo),
    /// A peer object known only by its hash; references live in the object
    /// itself and require a peer fetch to recover.
    PeerRaw(Hash),
}

impl ContentAddressWithReferences {
    /// Drop the reference information.
    pub fn to_plain(&self) -> ContentAddress {
        match self {
            ContentAddressWithReferences::Text(info) => ContentAddress::Text(info.hash),
            ContentAddressWithReferences::Fixed(info) => ContentAddress::Fixed {
                method: info.method,
                hash: info.hash,
            },
            ContentAddressWithReferences::Peer(info) => ContentAddress::Peer(info.hash),
            ContentAddressWithReferences::PeerRaw(hash) => ContentAddress::Peer(*hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256(data: &[u8]) -> Hash {
        Hash::of(Algorithm::Sha256, data)
    }

    #[test]
    fn test_render_parse_roundtrip() {
        let cases = [
            ContentAddress::Text(sha256(b"hello")),
            ContentAddress::Fixed {
                method: IngestionMethod::Flat,
                hash: sha256(b"flat"),
            },
            ContentAddress::Fixed {
                method: IngestionMethod::Recursive,
                hash: sha256(b"tree"),
            },
            ContentAddress::Fixed {
                method: IngestionMethod::Git,
                hash: Hash::of(Algorithm::Sha1, b"git tree"),
            },
            ContentAddress::Peer(sha256(b"peer object")),
        ];
        for ca in cases {
            let rendered = ca.render();
            assert_eq!(ContentAddress::parse(&rendered).unwrap(), ca);
        }
    }

    #[test]
    fn test_render_shapes() {
        let hash = sha256(b"world");
        assert_eq!(
            ContentAddress::Text(hash).render(),
            format!("text:sha256:{}", hash.to_base16())
        );
        assert_eq!(
            ContentAddress::Fixed {
                method: IngestionMethod::Recursive,
                hash
            }
            .render(),
            format!("fixed:r:sha256:{}", hash.to_base16())
        );
        assert_eq!(
            ContentAddress::Peer(hash).render(),
            format!("ipfs:f01711220{}", hash.to_base16())
        );
    }

    #[test]
    fn test_parse_unknown_prefix_fails() {
        assert!(matches!(
            ContentAddress::parse("blob:sha256:00"),
            Err(Error::Format(_))
        ));
        assert!(ContentAddress::parse("no-colon").is_err());
    }

    #[test]
    fn test_parse_opt_empty_is_none() {
        assert_eq!(ContentAddress::parse_opt("").unwrap(), None);
        assert!(ContentAddress::parse_opt("text:sha256:zz").is_err());
    }

    #[test]
    fn test_text_requires_sha256() {
        let md5 = Hash::of(Algorithm::Md5, b"x");
        let s = format!("text:{}", md5.to_text(HashEncoding::Base16, true));
        assert!(ContentAddress::parse(&s).is_err());
    }

    #[test]
    fn test_path_references_self_roundtrip() {
        let me = StorePath::from_basename("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-me").unwrap();
        let dep = StorePath::from_basename("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-dep").unwrap();

        let mut refs = PathReferences::default();
        refs.insert_possibly_self(&me, me.clone());
        refs.insert_possibly_self(&me, dep.clone());
        assert!(refs.has_self_reference);
        assert!(!refs.references.contains(&me));

        let flattened = refs.possibly_to_self(&me);
        assert!(flattened.contains(&me));
        assert!(flattened.contains(&dep));

        let mut rebuilt = PathReferences::default();
        rebuilt.set_possibly_self(&me, flattened);
        assert_eq!(rebuilt, refs);
    }

    #[test]
    fn test_set_possibly_self_without_self() {
        let me = StorePath::from_basename("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-me").unwrap();
        let dep = StorePath::from_basename("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-dep").unwrap();
        let mut refs = PathReferences::default();
        refs.set_possibly_self(&me, BTreeSet::from([dep.clone()]));
        assert!(!refs.has_self_reference);
        assert_eq!(refs.references, BTreeSet::from([dep]));
    }
}
