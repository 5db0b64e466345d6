//! Store backend dispatch.
//!
//! URIs map to backends through an ordered predicate table. Query-string
//! parameters are split off, handed to the backend, and unknown keys
//! surface a one-time warning at open.

use crate::archive::{FlatArchiver, TreeArchiver};
use crate::binary_cache::BinaryCacheStore;
use crate::config::{StoreConfig, StoreParams};
use crate::local::LocalStore;
use crate::object_store::FsObjectStore;
use crate::peer_store::{PeerClient, PeerRoot, PeerStore};
use crate::remote::RemoteStore;
use crate::traits::Store;
use keg_core::{Error, Result};
use keg_signer::StoreSigner;
use std::sync::Arc;
use tracing::warn;

/// Parameters every backend understands.
const KNOWN_PARAMS: &[&str] = &[
    "root",
    "state",
    "socket",
    "remote-program",
    "ssh-key",
    "secret-key-file",
    "priority",
];

/// Default daemon socket location.
const DAEMON_SOCKET: &str = "/var/keg/daemon.socket";

/// Split `uri?k=v&...` into the base URI and its parameter map.
pub fn split_uri_params(uri: &str) -> (String, StoreParams) {
    let mut params = StoreParams::new();
    let (base, query) = match uri.split_once('?') {
        Some((base, query)) => (base, query),
        None => return (uri.to_string(), params),
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => params.insert(key.to_string(), value.to_string()),
            None => params.insert(pair.to_string(), String::new()),
        };
    }
    (base.to_string(), params)
}

/// Opens stores from URIs.
///
/// The tree archiver and the peer-network client are external
/// collaborators; the defaults cover single-file artifacts and no peer
/// network.
pub struct Dispatcher {
    config: StoreConfig,
    archiver: Arc<dyn TreeArchiver>,
    peer_client: Option<Arc<dyn PeerClient>>,
}

impl Dispatcher {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            archiver: Arc::new(FlatArchiver),
            peer_client: None,
        }
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn TreeArchiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn with_peer_client(mut self, client: Arc<dyn PeerClient>) -> Self {
        self.peer_client = Some(client);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Open the store a URI denotes.
    ///
    /// Accepted forms: `local`, `daemon`, `auto`, the empty string,
    /// `ssh://host`, `file:///path`, `ipfs://cid`, `ipns://name`, an
    /// absolute path, and a `./relative` path.
    pub async fn open(&self, uri: &str) -> Result<Arc<dyn Store>> {
        let (base, params) = split_uri_params(uri);
        for key in params.keys() {
            if !KNOWN_PARAMS.contains(&key.as_str()) {
                warn!(uri, param = %key, "ignoring unknown store parameter");
            }
        }

        if base.is_empty() || base == "auto" || base == "local" {
            let store =
                LocalStore::open(&self.config, &params, Arc::clone(&self.archiver)).await?;
            return Ok(store);
        }

        if base == "daemon" {
            let socket = params
                .get("socket")
                .map(String::as_str)
                .unwrap_or(DAEMON_SOCKET);
            let store: Arc<dyn Store> = RemoteStore::open_daemon(socket, &self.config).await?;
            return Ok(store);
        }

        if let Some(host) = base.strip_prefix("ssh://") {
            if host.is_empty() {
                return Err(Error::Format(format!("'{uri}' has no host")));
            }
            let store: Arc<dyn Store> = RemoteStore::open_ssh(host, &self.config, &params).await?;
            return Ok(store);
        }

        if let Some(path) = base.strip_prefix("file://") {
            if path.is_empty() {
                return Err(Error::Format(format!("'{uri}' has no path")));
            }
            let signer = match params.get("secret-key-file") {
                None => None,
                Some(file) => {
                    let key = tokio::fs::read_to_string(file).await?;
                    Some(StoreSigner::from_secret_key(key.trim())?)
                }
            };
            let objects = FsObjectStore::open(path).await?;
            let store: Arc<dyn Store> =
                BinaryCacheStore::open(objects, base.clone(), &self.config, signer).await?;
            return Ok(store);
        }

        if let Some(cid) = base.strip_prefix("ipfs://") {
            let client = self.peer_client()?;
            let store: Arc<dyn Store> =
                PeerStore::open(client, PeerRoot::Index(cid.to_string()), &self.config)?;
            return Ok(store);
        }

        if let Some(name) = base.strip_prefix("ipns://") {
            let client = self.peer_client()?;
            let store: Arc<dyn Store> =
                PeerStore::open(client, PeerRoot::Name(name.to_string()), &self.config)?;
            return Ok(store);
        }

        if base.starts_with('/') || base.starts_with("./") {
            let root = if let Some(relative) = base.strip_prefix("./") {
                std::env::current_dir()?.join(relative)
            } else {
                std::path::PathBuf::from(&base)
            };
            let mut params = params;
            params.insert("root".to_string(), root.to_string_lossy().into_owned());
            let store =
                LocalStore::open(&self.config, &params, Arc::clone(&self.archiver)).await?;
            return Ok(store);
        }

        Err(Error::Format(format!("don't know how to open store '{uri}'")))
    }

    /// Open the configured substituters, ordered by priority. Stores that
    /// fail to open are skipped with a warning.
    pub async fn substituters(&self) -> Vec<Arc<dyn Store>> {
        let mut stores: Vec<Arc<dyn Store>> = Vec::new();
        for uri in &self.config.substituters {
            match self.open(uri).await {
                Ok(store) => stores.push(store),
                Err(e) => warn!(uri = %uri, error = %e, "cannot open substituter"),
            }
        }
        stores.sort_by_key(|store| store.priority());
        stores
    }

    fn peer_client(&self) -> Result<Arc<dyn PeerClient>> {
        self.peer_client
            .as_ref()
            .map(Arc::clone)
            .ok_or(Error::Unsupported("peer network transport"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_uri_params() {
        let (base, params) = split_uri_params("ssh://host?ssh-key=/k&compress=1");
        assert_eq!(base, "ssh://host");
        assert_eq!(params.get("ssh-key").unwrap(), "/k");
        assert_eq!(params.get("compress").unwrap(), "1");

        let (base, params) = split_uri_params("local");
        assert_eq!(base, "local");
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        let dispatcher = Dispatcher::new(StoreConfig::default());
        assert!(dispatcher.open("gopher://hole").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_uri_without_client_is_unsupported() {
        let dispatcher = Dispatcher::new(StoreConfig::default());
        assert!(matches!(
            dispatcher.open("ipfs://f01711220aa").await,
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            dispatcher.open("ipns://k51xyz").await,
            Err(Error::Unsupported(_))
        ));
    }
}
