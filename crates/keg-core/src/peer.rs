//! Peer-network (IPFS-shaped) object identities.
//!
//! Objects on the peer network are keyed by a CID: version 1, dag-cbor
//! codec, SHA-256 multihash. The metadata object for a store path is
//! canonical DAG-CBOR; hashing it reproduces the CID, which is what makes
//! peer paths verifiable end to end.

use crate::content_address::PeerInfo;
use crate::encoding;
use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash};
use crate::store_path::StorePathName;
use libipld::cbor::DagCborCodec;
use libipld::multihash::Multihash;
use libipld::prelude::Codec;
use libipld::{Cid, Ipld};
use std::collections::BTreeMap;
use std::fmt;

/// Multicodec code for dag-cbor.
const DAG_CBOR_CODE: u64 = 0x71;

/// Multihash code for SHA2-256.
const SHA2_256_CODE: u64 = 0x12;

/// Textual prefix of a v1 dag-cbor/sha2-256 CID in base-16 multibase:
/// `f` (base16) `01` (version) `71` (codec) `12` (hash fn) `20` (length).
const CID_PREFIX: &str = "f01711220";

/// A reference to another peer object: the target's name and object hash.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerRef {
    pub name: StorePathName,
    pub hash: Hash,
}

/// Render a SHA-256 hash as the textual CID form.
pub fn cid_text(hash: &Hash) -> Result<String> {
    if hash.algorithm() != Algorithm::Sha256 {
        return Err(Error::Format("peer object hashes must be SHA-256".into()));
    }
    Ok(format!("{CID_PREFIX}{}", hash.to_base16()))
}

/// Parse the textual CID form back into a hash.
pub fn parse_cid_text(cid: &str) -> Result<Hash> {
    let digest = cid.strip_prefix(CID_PREFIX).ok_or_else(|| {
        Error::Format(format!(
            "CID '{cid}' is not a base-16 v1 dag-cbor sha2-256 CID"
        ))
    })?;
    if digest.len() != 64 {
        return Err(Error::Format(format!("CID '{cid}' has a truncated digest")));
    }
    Hash::from_digest(Algorithm::Sha256, &encoding::base16_decode(digest)?)
}

/// The binary CID. DAG-CBOR links serialize as CBOR tag 42 over a zero
/// multibase byte followed by these bytes, giving the canonical
/// `(0x00, 0x71, 0x12, 0x20, digest)` packing.
pub fn cid_binary(hash: &Hash) -> Result<Cid> {
    if hash.algorithm() != Algorithm::Sha256 {
        return Err(Error::Format("peer object hashes must be SHA-256".into()));
    }
    let multihash = Multihash::wrap(SHA2_256_CODE, hash.digest())
        .map_err(|e| Error::Other(format!("multihash packing failed: {e}")))?;
    Ok(Cid::new_v1(DAG_CBOR_CODE, multihash))
}

/// Recover the hash from a binary CID.
pub fn hash_from_cid(cid: &Cid) -> Result<Hash> {
    if cid.codec() != DAG_CBOR_CODE || cid.hash().code() != SHA2_256_CODE {
        return Err(Error::Format(format!("unsupported CID '{cid}'")));
    }
    Hash::from_digest(Algorithm::Sha256, cid.hash().digest())
}

/// Build the canonical metadata object for a named peer path.
///
/// Map keys sort lexicographically (the map representation is ordered), and
/// references sort by name, so the encoding is a pure function of the value.
pub fn peer_object(name: &StorePathName, info: &PeerInfo) -> Result<Ipld> {
    let mut references: Vec<Ipld> = Vec::with_capacity(info.references.references.len());
    for reference in &info.references.references {
        let mut entry = BTreeMap::new();
        entry.insert("cid".to_string(), Ipld::Link(cid_binary(&reference.hash)?));
        entry.insert("name".to_string(), Ipld::String(reference.name.as_str().to_string()));
        references.push(Ipld::Map(entry));
    }

    let mut reference_set = BTreeMap::new();
    reference_set.insert(
        "hasSelfReference".to_string(),
        Ipld::Bool(info.references.has_self_reference),
    );
    reference_set.insert("references".to_string(), Ipld::List(references));

    let mut object = BTreeMap::new();
    object.insert("cid".to_string(), Ipld::Link(cid_binary(&info.hash)?));
    object.insert("name".to_string(), Ipld::String(name.as_str().to_string()));
    object.insert("references".to_string(), Ipld::Map(reference_set));
    Ok(Ipld::Map(object))
}

/// Encode the metadata object to canonical DAG-CBOR bytes.
pub fn encode_peer_object(name: &StorePathName, info: &PeerInfo) -> Result<Vec<u8>> {
    let object = peer_object(name, info)?;
    DagCborCodec
        .encode(&object)
        .map_err(|e| Error::Other(format!("CBOR encoding failed: {e}")))
}

/// Decode a metadata object fetched from the peer network.
pub fn decode_peer_object(bytes: &[u8]) -> Result<(StorePathName, PeerInfo)> {
    let object: Ipld = DagCborCodec
        .decode(bytes)
        .map_err(|e| Error::Format(format!("invalid CBOR peer object: {e}")))?;

    let map = as_map(&object)?;
    let name = StorePathName::new(as_string(get(map, "name")?)?)?;
    let hash = hash_from_cid(as_link(get(map, "cid")?)?)?;

    let reference_set = as_map(get(map, "references")?)?;
    let has_self_reference = match get(reference_set, "hasSelfReference")? {
        Ipld::Bool(b) => *b,
        _ => return Err(Error::Format("peer object: hasSelfReference is not a bool".into())),
    };
    let mut info = PeerInfo {
        hash,
        references: Default::default(),
    };
    info.references.has_self_reference = has_self_reference;

    let entries = match get(reference_set, "references")? {
        Ipld::List(entries) => entries,
        _ => return Err(Error::Format("peer object: references is not a list".into())),
    };
    for entry in entries {
        let entry = as_map(entry)?;
        info.references.references.insert(PeerRef {
            name: StorePathName::new(as_string(get(entry, "name")?)?)?,
            hash: hash_from_cid(as_link(get(entry, "cid")?)?)?,
        });
    }
    Ok((name, info))
}

/// Hash the canonical metadata object. This is the path-determining hash of
/// a peer content address.
pub fn compute_peer_hash(name: &StorePathName, info: &PeerInfo) -> Result<Hash> {
    Ok(Hash::of(Algorithm::Sha256, &encode_peer_object(name, info)?))
}

fn as_map(ipld: &Ipld) -> Result<&BTreeMap<String, Ipld>> {
    match ipld {
        Ipld::Map(map) => Ok(map),
        _ => Err(Error::Format("peer object: expected a CBOR map".into())),
    }
}

fn as_string(ipld: &Ipld) -> Result<&str> {
    match ipld {
        Ipld::String(s) => Ok(s),
        _ => Err(Error::Format("peer object: expected a CBOR string".into())),
    }
}

fn as_link(ipld: &Ipld) -> Result<&Cid> {
    match ipld {
        Ipld::Link(cid) => Ok(cid),
        _ => Err(Error::Format("peer object: expected a CBOR link".into())),
    }
}

fn get<'a>(map: &'a BTreeMap<String, Ipld>, key: &str) -> Result<&'a Ipld> {
    map.get(key)
        .ok_or_else(|| Error::Format(format!("peer object: missing key '{key}'")))
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match cid_text(&self.hash) {
            Ok(cid) => write!(f, "{}:{}", self.name, cid),
            Err(_) => write!(f, "{}:?", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_address::PathReferences;

    fn sha256(data: &[u8]) -> Hash {
        Hash::of(Algorithm::Sha256, data)
    }

    fn name(s: &str) -> StorePathName {
        StorePathName::new(s).unwrap()
    }

    #[test]
    fn test_cid_text_roundtrip() {
        let hash = sha256(b"object");
        let cid = cid_text(&hash).unwrap();
        assert!(cid.starts_with("f01711220"));
        assert_eq!(cid.len(), 9 + 64);
        assert_eq!(parse_cid_text(&cid).unwrap(), hash);
    }

    #[test]
    fn test_cid_text_rejects_non_sha256() {
        assert!(cid_text(&Hash::of(Algorithm::Sha1, b"x")).is_err());
        assert!(parse_cid_text("f01701220abcd").is_err());
    }

    #[test]
    fn test_cid_binary_shape() {
        let hash = sha256(b"object");
        let cid = cid_binary(&hash).unwrap();
        let bytes = cid.to_bytes();
        assert_eq!(&bytes[..4], &[0x01, 0x71, 0x12, 0x20]);
        assert_eq!(&bytes[4..], hash.digest());
        assert_eq!(hash_from_cid(&cid).unwrap(), hash);
    }

    fn sample_info() -> PeerInfo {
        let mut references = PathReferences::default();
        references.references.insert(PeerRef {
            name: name("dep-a"),
            hash: sha256(b"dep a"),
        });
        references.references.insert(PeerRef {
            name: name("dep-b"),
            hash: sha256(b"dep b"),
        });
        PeerInfo {
            hash: sha256(b"data object"),
            references,
        }
    }

    #[test]
    fn test_peer_object_roundtrip() {
        let info = sample_info();
        let bytes = encode_peer_object(&name("pkg"), &info).unwrap();
        let (decoded_name, decoded) = decode_peer_object(&bytes).unwrap();
        assert_eq!(decoded_name.as_str(), "pkg");
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_peer_hash_is_deterministic_and_reference_sensitive() {
        let info = sample_info();
        let a = compute_peer_hash(&name("pkg"), &info).unwrap();
        let b = compute_peer_hash(&name("pkg"), &info).unwrap();
        assert_eq!(a, b);

        let mut other = info.clone();
        other.references.has_self_reference = true;
        assert_ne!(a, compute_peer_hash(&name("pkg"), &other).unwrap());
        assert_ne!(a, compute_peer_hash(&name("pkg2"), &info).unwrap());
    }

    #[test]
    fn test_encoded_object_contains_tag_42() {
        // CBOR tag 42 encodes as 0xd8 0x2a; links must carry it
        let bytes = encode_peer_object(&name("pkg"), &sample_info()).unwrap();
        let tagged = bytes.windows(2).filter(|w| w == &[0xd8, 0x2a]).count();
        // one link for the object itself, one per reference
        assert_eq!(tagged, 3);
    }
}
