//! The local store: artifacts on the filesystem, metadata in the registry.

use crate::archive::TreeArchiver;
use crate::cache::StoreStats;
use crate::config::{StoreConfig, StoreParams};
use crate::interrupt::check_interrupt;
use crate::stream::{once_stream, ByteStream, HashSink};
use crate::traits::{Store, StoreState};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use keg_core::content_address::{
    ContentAddressWithReferences, FixedOutputInfo, IngestionMethod, PathReferences, TextInfo,
};
use keg_core::hash::{Algorithm, Hash};
use keg_core::store_path::{StoreDir, StorePath, StorePathName};
use keg_core::{Derivation, DrvHashContext, Error, Result, ValidPathInfo};
use keg_registry::SqliteRegistry;
use keg_signer::{verify_any, TrustedKeys};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs;
use tracing::{debug, info};

/// A store rooted on the local filesystem.
pub struct LocalStore {
    store_dir: StoreDir,
    uri: String,
    real_store_dir: PathBuf,
    registry: SqliteRegistry,
    state: StoreState,
    archiver: Arc<dyn TreeArchiver>,
    trusted_keys: TrustedKeys,
    drv_hashes: DrvHashContext,
}

impl LocalStore {
    /// Open a local store. The `root` parameter relocates the physical tree
    /// (the logical store directory stays what the config says); `state`
    /// relocates the registry database.
    pub async fn open(
        config: &StoreConfig,
        params: &StoreParams,
        archiver: Arc<dyn TreeArchiver>,
    ) -> Result<Arc<Self>> {
        let store_dir = config.store_dir()?;

        let root = params.get("root").map(PathBuf::from);
        let real_store_dir = match &root {
            Some(root) => root.join(store_dir.as_str().trim_start_matches('/')),
            None => PathBuf::from(store_dir.as_str()),
        };
        let state_dir = match params.get("state") {
            Some(state) => PathBuf::from(state),
            None => match &root {
                Some(root) => root.join("var/keg"),
                None => PathBuf::from("/var/keg"),
            },
        };

        fs::create_dir_all(&real_store_dir).await?;
        fs::create_dir_all(state_dir.join("db")).await?;

        let registry = SqliteRegistry::open(state_dir.join("db/registry.sqlite"), store_dir.clone())
            .await
            .map_err(keg_core::Error::from)?;

        let trusted_keys =
            TrustedKeys::from_store_formats(config.trusted_public_keys.iter().map(String::as_str))?;

        let loader_dir = real_store_dir.clone();
        let drv_hashes = DrvHashContext::new(store_dir.clone(), move |path: &StorePath| {
            std::fs::read_to_string(loader_dir.join(path.basename())).map_err(Error::Io)
        });

        let uri = match &root {
            Some(root) => root.to_string_lossy().into_owned(),
            None => "local".to_string(),
        };

        info!(uri = %uri, store_dir = %store_dir, "opened local store");
        Ok(Arc::new(Self {
            store_dir,
            uri,
            real_store_dir,
            registry,
            state: StoreState::new(config, None),
            archiver,
            trusted_keys,
            drv_hashes,
        }))
    }

    /// Physical location of a store path.
    pub fn real_path(&self, path: &StorePath) -> PathBuf {
        self.real_store_dir.join(path.basename())
    }

    /// The hash-modulo memo context scoped to this store.
    pub fn drv_hash_context(&self) -> &DrvHashContext {
        &self.drv_hashes
    }

    pub fn registry(&self) -> &SqliteRegistry {
        &self.registry
    }

    fn check_trust(&self, info: &ValidPathInfo, check_sigs: bool) -> Result<()> {
        if !check_sigs {
            return Ok(());
        }
        // content-addressed paths authenticate themselves
        if info.is_content_addressed(&self.store_dir)? {
            return Ok(());
        }
        let fingerprint = info.fingerprint(&self.store_dir)?;
        if verify_any(&fingerprint, &info.sigs, &self.trusted_keys) {
            Ok(())
        } else {
            Err(Error::Signature(self.store_dir.print_path(&info.path)))
        }
    }

    async fn restore_bytes(&self, path: &StorePath, data: Bytes) -> Result<()> {
        let real = self.real_path(path);
        let tmp = self.real_store_dir.join(format!(".tmp-{}", path.basename()));
        if fs::try_exists(&tmp).await? {
            fs::remove_file(&tmp).await.ok();
        }
        self.archiver.restore(once_stream(data), &tmp).await?;
        fs::rename(&tmp, &real).await?;
        Ok(())
    }

    /// Store a text artifact (e.g. a derivation file) and register it.
    pub async fn add_text_to_store(
        &self,
        name: &StorePathName,
        contents: &str,
        references: BTreeSet<StorePath>,
    ) -> Result<StorePath> {
        let text_info = TextInfo {
            hash: Hash::of(Algorithm::Sha256, contents.as_bytes()),
            references,
        };
        let path = self.store_dir.make_text_path(name, &text_info)?;
        if self.is_valid_path((&path).into()).await? {
            return Ok(path);
        }

        let nar_hash = Hash::of(Algorithm::Sha256, contents.as_bytes());
        let mut info = ValidPathInfo::new(path.clone(), nar_hash, contents.len() as u64);
        info.references.references = text_info.references.clone();
        info.ca = Some(keg_core::ContentAddress::Text(text_info.hash));
        info.ultimate = true;

        self.add_to_store(
            &info,
            once_stream(Bytes::from(contents.to_string())),
            false,
            false,
        )
        .await?;
        Ok(path)
    }

    /// Ingest a filesystem path under a fixed-output content address.
    /// Returns the store path and the content hash.
    pub async fn add_path_to_store(
        &self,
        name: &StorePathName,
        source: &Path,
        method: IngestionMethod,
        algorithm: Algorithm,
    ) -> Result<(StorePath, Hash)> {
        check_interrupt()?;
        let content_hash = match method {
            IngestionMethod::Flat => {
                let data = fs::read(source).await?;
                Hash::of(algorithm, &data)
            }
            IngestionMethod::Recursive => {
                let mut dumped = self.archiver.dump(source).await?;
                let mut sink = HashSink::new(algorithm);
                while let Some(chunk) = dumped.next().await {
                    check_interrupt()?;
                    sink.update(&chunk?);
                }
                sink.finish().0
            }
            IngestionMethod::Git => {
                // git tree hashing lives in the external serializer
                return Err(Error::Unsupported("addPathToStore(git)"));
            }
        };

        let ca = FixedOutputInfo {
            method,
            hash: content_hash,
            references: PathReferences::default(),
        };
        let path = self.store_dir.make_fixed_output_path(name, &ca)?;

        if !self.is_valid_path((&path).into()).await? {
            let dumped = self.archiver.dump(source).await?;
            let data = crate::stream::collect(dumped).await?;
            let nar_hash = Hash::of(Algorithm::Sha256, &data);
            let mut info = ValidPathInfo::new(path.clone(), nar_hash, data.len() as u64);
            info.ca = Some(keg_core::ContentAddress::Fixed { method, hash: content_hash });
            info.ultimate = true;
            self.add_to_store(&info, once_stream(data), false, false).await?;
        }
        Ok((path, content_hash))
    }

    /// Serialize a derivation into the store.
    pub async fn write_derivation(&self, drv: &Derivation, name: &str) -> Result<StorePath> {
        let mut references: BTreeSet<StorePath> = drv.input_srcs.clone();
        references.extend(drv.input_drvs.keys().cloned());
        let contents = drv.unparse(&self.store_dir, false, None);
        let name = StorePathName::new(format!("{name}{}", keg_core::DRV_EXTENSION))?;
        let drv_path = self.add_text_to_store(&name, &contents, references).await?;

        // record declared outputs for reverse lookups
        for (id, output) in &drv.outputs {
            if let Some(output_path) = &output.path {
                self.registry
                    .add_derivation_output(&drv_path, id, output_path)
                    .await
                    .map_err(keg_core::Error::from)?;
            }
        }
        Ok(drv_path)
    }

    /// Read a derivation back from the store.
    pub async fn read_derivation(&self, path: &StorePath) -> Result<Derivation> {
        let text = fs::read_to_string(self.real_path(path)).await?;
        Derivation::parse(&self.store_dir, &text)
    }

    /// Delete a path. Refused while other valid paths reference it.
    pub async fn delete_path(&self, path: &StorePath) -> Result<()> {
        self.registry
            .delete(path)
            .await
            .map_err(keg_core::Error::from)?;
        let real = self.real_path(path);
        if fs::try_exists(&real).await? {
            fs::remove_file(&real).await?;
        }
        self.state.cache.insert_missing(path.hash_part().as_str());
        Ok(())
    }
}

#[async_trait]
impl Store for LocalStore {
    fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn state(&self) -> &StoreState {
        &self.state
    }

    async fn query_path_info_uncached(&self, path: &StorePath) -> Result<Option<ValidPathInfo>> {
        let found = self
            .registry
            .lookup(path.hash_part().as_str())
            .await
            .map_err(keg_core::Error::from)?;
        Ok(found)
    }

    async fn add_to_store(
        &self,
        info: &ValidPathInfo,
        mut source: ByteStream,
        repair: bool,
        check_sigs: bool,
    ) -> Result<()> {
        check_interrupt()?;
        let printed = self.store_dir.print_path(&info.path);

        if !repair && self.is_valid_path((&info.path).into()).await? {
            debug!(path = %printed, "path already valid, skipping ingest");
            return Ok(());
        }

        self.check_trust(info, check_sigs)?;

        let mut data = Vec::new();
        while let Some(chunk) = source.next().await {
            check_interrupt()?;
            data.extend_from_slice(&chunk?);
        }
        let (got_hash, got_size) = crate::stream::hash_nar_for_info(info, &data);

        if got_hash != info.nar_hash || (info.nar_size != 0 && got_size != info.nar_size) {
            return Err(Error::HashMismatch {
                path: printed,
                expected: format!("{} ({} bytes)", info.nar_hash, info.nar_size),
                actual: format!("{} ({} bytes)", got_hash, got_size),
            });
        }

        let real = self.real_path(&info.path);
        if repair && fs::try_exists(&real).await? {
            fs::remove_file(&real).await?;
        }
        if !fs::try_exists(&real).await? {
            self.restore_bytes(&info.path, Bytes::from(data)).await?;
        }

        let mut registered = info.clone();
        if registered.registration_time == 0 {
            registered.registration_time = OffsetDateTime::now_utc().unix_timestamp();
        }
        self.registry
            .register(&registered)
            .await
            .map_err(keg_core::Error::from)?;

        self.state
            .cache
            .insert_present(info.path.hash_part().as_str(), Arc::new(registered));
        StoreStats::bump(&self.state.stats.path_info_read);
        info!(path = %printed, bytes = got_size, "path added to local store");
        Ok(())
    }

    async fn nar_from_path(&self, path: &StorePath) -> Result<ByteStream> {
        self.query_path_info(path.into()).await?;
        self.archiver.dump(&self.real_path(path)).await
    }

    async fn query_path_from_hash_part(&self, hash_part: &str) -> Result<Option<StorePath>> {
        let found = self
            .registry
            .path_from_hash_part(hash_part)
            .await
            .map_err(keg_core::Error::from)?;
        Ok(found)
    }
}

/// Ingest helper mirroring the text path but for content-addressed
/// registration descriptors.
pub async fn add_ca_to_store(
    store: &LocalStore,
    name: &StorePathName,
    ca: ContentAddressWithReferences,
    data: Bytes,
) -> Result<StorePath> {
    let nar_hash = Hash::of(Algorithm::Sha256, &data);
    let info = ValidPathInfo::from_ca(store.store_dir(), name, ca, nar_hash, data.len() as u64)?;
    let path = info.path.clone();
    store.add_to_store(&info, once_stream(data), false, false).await?;
    Ok(path)
}
