//! The store abstraction and its backend-independent query pipeline.

use crate::cache::{PathInfoCache, StoreStats};
use crate::config::StoreConfig;
use crate::interrupt::check_interrupt;
use crate::stream::ByteStream;
use async_trait::async_trait;
use futures::stream::StreamExt;
use keg_core::content_address::ContentAddressWithReferences;
use keg_core::store_path::{StoreDir, StorePath, StorePathName};
use keg_core::{Derivation, Error, Result, ValidPathInfo};
use keg_registry::{CacheLookup, DiskCache};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// A query key: either a store path, or a content-address descriptor that
/// first gets baked into one.
#[derive(Clone, Copy, Debug)]
pub enum StorePathOrCa<'a> {
    Path(&'a StorePath),
    Ca {
        name: &'a StorePathName,
        ca: &'a ContentAddressWithReferences,
    },
}

impl StorePathOrCa<'_> {
    /// Resolve to a concrete store path.
    pub fn bake(&self, store_dir: &StoreDir) -> Result<StorePath> {
        match self {
            StorePathOrCa::Path(path) => Ok((*path).clone()),
            StorePathOrCa::Ca { name, ca } => store_dir.make_path_from_ca(name, ca),
        }
    }
}

impl<'a> From<&'a StorePath> for StorePathOrCa<'a> {
    fn from(path: &'a StorePath) -> Self {
        StorePathOrCa::Path(path)
    }
}

/// Shared per-store state: the hot cache, the optional disk cache, lookup
/// statistics, and the worker bound for fan-out queries.
pub struct StoreState {
    pub cache: PathInfoCache,
    pub disk_cache: Option<Arc<DiskCache>>,
    pub stats: StoreStats,
    pub max_jobs: usize,
}

impl StoreState {
    pub fn new(config: &StoreConfig, disk_cache: Option<Arc<DiskCache>>) -> Self {
        Self {
            cache: PathInfoCache::new(
                config.path_info_cache_size,
                config.positive_ttl(),
                config.negative_ttl(),
            ),
            disk_cache,
            stats: StoreStats::default(),
            max_jobs: config.max_substitution_jobs.max(1),
        }
    }
}

/// Open the configured on-disk lookup cache, if any. Shared by the
/// remote-facing backends; the local store never needs it.
pub async fn open_disk_cache(config: &StoreConfig) -> Result<Option<Arc<DiskCache>>> {
    match &config.disk_cache_path {
        None => Ok(None),
        Some(path) => {
            let cache = DiskCache::open(path, config.positive_ttl(), config.negative_ttl())
                .await
                .map_err(keg_core::Error::from)?;
            Ok(Some(Arc::new(cache)))
        }
    }
}

/// A store backend.
///
/// Backends implement the uncached operations; the caching pipeline,
/// validity fan-out, and everything derivable from them are default
/// methods. Operations a backend cannot honor return
/// [`Error::Unsupported`].
#[async_trait]
pub trait Store: Send + Sync {
    /// The logical store directory paths are fingerprinted against.
    fn store_dir(&self) -> &StoreDir;

    /// The URI this store was opened from.
    fn uri(&self) -> String;

    /// Shared cache and statistics state.
    fn state(&self) -> &StoreState;

    /// Substituter priority; lower wins.
    fn priority(&self) -> u32 {
        0
    }

    /// Fetch path info from the backend, bypassing caches. `None` means the
    /// path is not present (which the pipeline caches negatively).
    async fn query_path_info_uncached(&self, path: &StorePath) -> Result<Option<ValidPathInfo>>;

    /// Ingest an artifact: verify, store the bytes, register the path.
    async fn add_to_store(
        &self,
        info: &ValidPathInfo,
        source: ByteStream,
        repair: bool,
        check_sigs: bool,
    ) -> Result<()>;

    /// Stream the canonical serialization of a path's tree.
    async fn nar_from_path(&self, path: &StorePath) -> Result<ByteStream>;

    /// Establish connectivity (remote stores override).
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Protocol version spoken by the remote side, if any.
    fn protocol_version(&self) -> Option<u64> {
        None
    }

    /// Query path info through the cache hierarchy: in-memory LRU, then the
    /// disk cache, then the backend; results are written through. A backend
    /// answer about a different hash part is treated as invalid.
    async fn query_path_info(&self, key: StorePathOrCa<'_>) -> Result<Arc<ValidPathInfo>> {
        let store_path = key.bake(self.store_dir())?;
        let hash_part = store_path.hash_part().as_str().to_string();
        let printed = self.store_dir().print_path(&store_path);
        let state = self.state();

        if let Some(entry) = state.cache.get(&hash_part) {
            StoreStats::bump(&state.stats.path_info_read_averted);
            return match entry.info {
                Some(info) => Ok(info),
                None => Err(Error::InvalidPath(printed)),
            };
        }

        if let Some(disk_cache) = &state.disk_cache {
            match disk_cache
                .lookup(self.store_dir(), &self.uri(), &hash_part)
                .await
                .map_err(keg_core::Error::from)?
            {
                CacheLookup::Unknown => {}
                CacheLookup::Missing => {
                    StoreStats::bump(&state.stats.path_info_read_averted);
                    state.cache.insert_missing(&hash_part);
                    return Err(Error::InvalidPath(printed));
                }
                CacheLookup::Present(info) => {
                    StoreStats::bump(&state.stats.path_info_read_averted);
                    let info = Arc::new(info);
                    state.cache.insert_present(&hash_part, Arc::clone(&info));
                    if info.path != store_path {
                        return Err(Error::InvalidPath(printed));
                    }
                    return Ok(info);
                }
            }
        }

        StoreStats::bump(&state.stats.path_info_read);
        let fetched = self.query_path_info_uncached(&store_path).await?;

        match fetched {
            None => {
                StoreStats::bump(&state.stats.path_info_missing);
                if let Some(disk_cache) = &state.disk_cache {
                    disk_cache
                        .upsert_missing(&self.uri(), &hash_part)
                        .await
                        .map_err(keg_core::Error::from)?;
                }
                state.cache.insert_missing(&hash_part);
                Err(Error::InvalidPath(printed))
            }
            Some(info) => {
                if let Some(disk_cache) = &state.disk_cache {
                    disk_cache
                        .upsert_present(self.store_dir(), &self.uri(), &info)
                        .await
                        .map_err(keg_core::Error::from)?;
                }
                let info = Arc::new(info);
                state.cache.insert_present(&hash_part, Arc::clone(&info));
                if info.path != store_path {
                    StoreStats::bump(&state.stats.path_info_missing);
                    return Err(Error::InvalidPath(printed));
                }
                Ok(info)
            }
        }
    }

    /// Whether the key denotes a valid path, through the same caches.
    async fn is_valid_path(&self, key: StorePathOrCa<'_>) -> Result<bool> {
        match self.query_path_info(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_invalid_path() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The subset of `paths` that is valid here.
    ///
    /// Queries fan out over a bounded worker pool. `InvalidPath` results
    /// are filtered; any other error aborts the operation, but only after
    /// every in-flight query has finished.
    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
        _substitute: bool,
    ) -> Result<BTreeSet<StorePath>> {
        let results: Vec<(&StorePath, Result<Arc<ValidPathInfo>>)> =
            futures::stream::iter(paths.iter().map(|path| async move {
                let result = match check_interrupt() {
                    Ok(()) => self.query_path_info(path.into()).await,
                    Err(e) => Err(e),
                };
                (path, result)
            }))
            .buffer_unordered(self.state().max_jobs)
            .collect()
            .await;

        let mut valid = BTreeSet::new();
        let mut stashed: Option<Error> = None;
        for (path, result) in results {
            match result {
                Ok(_) => {
                    valid.insert(path.clone());
                }
                Err(e) if e.is_invalid_path() => {}
                Err(e) => {
                    debug!(path = %path, error = %e, "validity query failed");
                    if stashed.is_none() {
                        stashed = Some(e);
                    }
                }
            }
        }
        match stashed {
            Some(e) => Err(e),
            None => Ok(valid),
        }
    }

    /// Make sure the path is present, substituting if the backend can.
    async fn ensure_path(&self, key: StorePathOrCa<'_>) -> Result<()> {
        self.query_path_info(key).await.map(|_| ())
    }

    /// Build a derivation. Most backends cannot.
    async fn build_derivation(&self, _drv_path: &StorePath, _drv: &Derivation) -> Result<()> {
        Err(Error::Unsupported("buildDerivation"))
    }

    /// Resolve a bare hash part to a full path.
    async fn query_path_from_hash_part(&self, _hash_part: &str) -> Result<Option<StorePath>> {
        Err(Error::Unsupported("queryPathFromHashPart"))
    }
}
