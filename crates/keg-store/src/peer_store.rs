//! Peer-network store (`ipfs://` and `ipns://`).
//!
//! Objects live in a content-addressed peer network behind the
//! [`PeerClient`] interface (the daemon transport is an external
//! collaborator). The store keeps an index object mapping hash parts to the
//! metadata object and the serialized tree; `ipns://` roots are mutable
//! through name publishing, `ipfs://` roots are frozen.

use crate::config::StoreConfig;
use crate::interrupt::check_interrupt;
use crate::stream::{once_stream, ByteStream};
use crate::traits::{Store, StoreState};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use keg_core::content_address::{ContentAddress, PathReferences, PeerInfo};
use keg_core::hash::{Algorithm, Hash};
use keg_core::peer::{self, PeerRef};
use keg_core::store_path::{StoreDir, StorePath};
use keg_core::{Error, Result, ValidPathInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Transport to the peer daemon.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Fetch a block by CID.
    async fn block_get(&self, cid: &str) -> Result<Option<Bytes>>;

    /// Store a block, returning its CID.
    async fn block_put(&self, data: Bytes) -> Result<String>;

    /// Resolve a published name to a CID.
    async fn name_resolve(&self, name: &str) -> Result<Option<String>>;

    /// Publish a name to point at a CID.
    async fn name_publish(&self, name: &str, cid: &str) -> Result<()>;
}

#[async_trait]
impl<C: PeerClient + ?Sized> PeerClient for Arc<C> {
    async fn block_get(&self, cid: &str) -> Result<Option<Bytes>> {
        (**self).block_get(cid).await
    }

    async fn block_put(&self, data: Bytes) -> Result<String> {
        (**self).block_put(data).await
    }

    async fn name_resolve(&self, name: &str) -> Result<Option<String>> {
        (**self).name_resolve(name).await
    }

    async fn name_publish(&self, name: &str, cid: &str) -> Result<()> {
        (**self).name_publish(name, cid).await
    }
}

/// The store root: a frozen index object or a mutable published name.
#[derive(Clone, Debug)]
pub enum PeerRoot {
    Index(String),
    Name(String),
}

/// One index row: where the metadata and tree objects live, plus the bits
/// of path info the metadata object does not carry.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct IndexEntry {
    meta: String,
    nar: String,
    nar_hash: String,
    nar_size: u64,
    #[serde(default)]
    sigs: Vec<String>,
}

type Index = BTreeMap<String, IndexEntry>;

/// A store on the content-addressed peer network.
pub struct PeerStore<C: PeerClient> {
    client: C,
    root: PeerRoot,
    store_dir: StoreDir,
    uri: String,
    state: StoreState,
}

impl<C: PeerClient> PeerStore<C> {
    pub fn open(client: C, root: PeerRoot, config: &StoreConfig) -> Result<Arc<Self>> {
        let uri = match &root {
            PeerRoot::Index(cid) => format!("ipfs://{cid}"),
            PeerRoot::Name(name) => format!("ipns://{name}"),
        };
        info!(uri = %uri, "opened peer store");
        Ok(Arc::new(Self {
            client,
            root,
            store_dir: config.store_dir()?,
            uri,
            state: StoreState::new(config, None),
        }))
    }

    async fn index_cid(&self) -> Result<Option<String>> {
        match &self.root {
            PeerRoot::Index(cid) => Ok(Some(cid.clone())),
            PeerRoot::Name(name) => self.client.name_resolve(name).await,
        }
    }

    async fn load_index(&self) -> Result<Index> {
        let cid = match self.index_cid().await? {
            None => return Ok(Index::new()),
            Some(cid) => cid,
        };
        let data = self
            .client
            .block_get(&cid)
            .await?
            .ok_or_else(|| Error::Other(format!("peer index object '{cid}' is missing")))?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Format(format!("corrupt peer index '{cid}': {e}")))
    }

    async fn store_index(&self, index: &Index) -> Result<()> {
        let name = match &self.root {
            PeerRoot::Index(_) => return Err(Error::Unsupported("addToStore")),
            PeerRoot::Name(name) => name,
        };
        let data = serde_json::to_vec(index)
            .map_err(|e| Error::Other(format!("index serialization failed: {e}")))?;
        let cid = self.client.block_put(Bytes::from(data)).await?;
        self.client.name_publish(name, &cid).await?;
        debug!(uri = %self.uri, cid, "published peer index");
        Ok(())
    }
}

#[async_trait]
impl<C: PeerClient> Store for PeerStore<C> {
    fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn state(&self) -> &StoreState {
        &self.state
    }

    fn priority(&self) -> u32 {
        30
    }

    async fn query_path_info_uncached(&self, path: &StorePath) -> Result<Option<ValidPathInfo>> {
        let index = self.load_index().await?;
        let entry = match index.get(path.hash_part().as_str()) {
            None => return Ok(None),
            Some(entry) => entry,
        };

        let data = self
            .client
            .block_get(&entry.meta)
            .await?
            .ok_or_else(|| Error::Other(format!("peer object '{}' is missing", entry.meta)))?;
        let (name, peer_info) = peer::decode_peer_object(&data)?;

        // the object must hash back to the CID it was fetched under
        let expected = peer::parse_cid_text(&entry.meta)?;
        let computed = peer::compute_peer_hash(&name, &peer_info)?;
        if computed != expected {
            return Err(Error::HashMismatch {
                path: self.store_dir.print_path(path),
                expected: expected.to_string(),
                actual: computed.to_string(),
            });
        }

        let nar_hash = Hash::parse(&entry.nar_hash, Some(Algorithm::Sha256))?;
        let mut info = ValidPathInfo::new(path.clone(), nar_hash, entry.nar_size);
        info.references.has_self_reference = peer_info.references.has_self_reference;
        for reference in &peer_info.references.references {
            info.references
                .references
                .insert(self.store_dir.make_peer_path(&reference.name, &reference.hash)?);
        }
        for sig in &entry.sigs {
            info.sigs.insert(keg_core::Signature::parse(sig)?);
        }
        info.ca = Some(ContentAddress::Peer(computed));
        Ok(Some(info))
    }

    async fn add_to_store(
        &self,
        info: &ValidPathInfo,
        mut source: ByteStream,
        repair: bool,
        _check_sigs: bool,
    ) -> Result<()> {
        check_interrupt()?;
        let printed = self.store_dir.print_path(&info.path);
        let mut index = self.load_index().await?;
        if !repair && index.contains_key(info.path.hash_part().as_str()) {
            return Ok(());
        }

        let mut data = Vec::new();
        while let Some(chunk) = source.next().await {
            check_interrupt()?;
            data.extend_from_slice(&chunk?);
        }
        let (got_hash, got_size) = crate::stream::hash_nar_for_info(info, &data);
        if got_hash != info.nar_hash || (info.nar_size != 0 && got_size != info.nar_size) {
            return Err(Error::HashMismatch {
                path: printed,
                expected: info.nar_hash.to_string(),
                actual: got_hash.to_string(),
            });
        }

        let nar_cid = self.client.block_put(Bytes::from(data)).await?;

        // the metadata object references other peer objects by their hashes
        let mut references = PathReferences::<PeerRef>::default();
        references.has_self_reference = info.references.has_self_reference;
        for reference in &info.references.references {
            let entry = index.get(reference.hash_part().as_str()).ok_or_else(|| {
                Error::Other(format!(
                    "reference '{reference}' is not present in the peer store"
                ))
            })?;
            references.references.insert(PeerRef {
                name: reference.name().clone(),
                hash: peer::parse_cid_text(&entry.meta)?,
            });
        }
        let peer_info = PeerInfo {
            hash: peer::parse_cid_text(&nar_cid)?,
            references,
        };

        let meta_bytes = peer::encode_peer_object(info.path.name(), &peer_info)?;
        let meta_cid = self.client.block_put(Bytes::from(meta_bytes)).await?;

        // index under the peer-native path, plus the caller's path when it
        // differs (content copied from a store with another addressing)
        let meta_hash = peer::parse_cid_text(&meta_cid)?;
        let native = self.store_dir.make_peer_path(info.path.name(), &meta_hash)?;
        let entry = IndexEntry {
            meta: meta_cid,
            nar: nar_cid,
            nar_hash: info.nar_hash.to_text(keg_core::HashEncoding::Base32, true),
            nar_size: got_size,
            sigs: info.sigs.iter().map(ToString::to_string).collect(),
        };
        index.insert(native.hash_part().as_str().to_string(), entry.clone());
        if native != info.path {
            index.insert(info.path.hash_part().as_str().to_string(), entry);
        }
        self.store_index(&index).await?;
        info!(path = %printed, bytes = got_size, "path published to peer store");
        Ok(())
    }

    async fn nar_from_path(&self, path: &StorePath) -> Result<ByteStream> {
        self.query_path_info(path.into()).await?;
        let index = self.load_index().await?;
        let entry = index
            .get(path.hash_part().as_str())
            .ok_or_else(|| Error::InvalidPath(self.store_dir.print_path(path)))?;
        let data = self
            .client
            .block_get(&entry.nar)
            .await?
            .ok_or_else(|| Error::Other(format!("peer block '{}' is missing", entry.nar)))?;
        Ok(once_stream(data))
    }
}

/// In-memory peer network, for tests and offline experiments. Blocks are
/// keyed by the CID of their SHA-256 hash.
#[derive(Default)]
pub struct MemoryPeerClient {
    blocks: Mutex<HashMap<String, Bytes>>,
    names: Mutex<HashMap<String, String>>,
}

impl MemoryPeerClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerClient for MemoryPeerClient {
    async fn block_get(&self, cid: &str) -> Result<Option<Bytes>> {
        Ok(self.blocks.lock().expect("blocks poisoned").get(cid).cloned())
    }

    async fn block_put(&self, data: Bytes) -> Result<String> {
        let cid = peer::cid_text(&Hash::of(Algorithm::Sha256, &data))?;
        self.blocks
            .lock()
            .expect("blocks poisoned")
            .insert(cid.clone(), data);
        Ok(cid)
    }

    async fn name_resolve(&self, name: &str) -> Result<Option<String>> {
        Ok(self.names.lock().expect("names poisoned").get(name).cloned())
    }

    async fn name_publish(&self, name: &str, cid: &str) -> Result<()> {
        self.names
            .lock()
            .expect("names poisoned")
            .insert(name.to_string(), cid.to_string());
        Ok(())
    }
}
