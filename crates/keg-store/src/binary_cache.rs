//! Binary-cache store over an object store.
//!
//! Path info lives as text under `<hash part>.narinfo`; the serialized
//! trees live under `nar/<hash part>.nar`. The object store itself is the
//! source of truth; there is no registry.

use crate::config::StoreConfig;
use crate::interrupt::check_interrupt;
use crate::object_store::ObjectStore;
use crate::stream::{once_stream, ByteStream};
use crate::traits::{Store, StoreState};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use keg_core::store_path::{StoreDir, StorePath};
use keg_core::{Error, Result, ValidPathInfo};
use keg_signer::{verify_any, StoreSigner, TrustedKeys};
use std::sync::Arc;
use tracing::{debug, info};

/// A store whose contents are flat objects in a cache (file://, and the
/// same shape over HTTP or S3 clients).
pub struct BinaryCacheStore<O: ObjectStore> {
    objects: O,
    store_dir: StoreDir,
    uri: String,
    state: StoreState,
    trusted_keys: TrustedKeys,
    signer: Option<StoreSigner>,
    priority: u32,
}

impl<O: ObjectStore> BinaryCacheStore<O> {
    pub async fn open(
        objects: O,
        uri: impl Into<String>,
        config: &StoreConfig,
        signer: Option<StoreSigner>,
    ) -> Result<Arc<Self>> {
        let store_dir = config.store_dir()?;
        let trusted_keys =
            TrustedKeys::from_store_formats(config.trusted_public_keys.iter().map(String::as_str))?;
        let disk_cache = crate::traits::open_disk_cache(config).await?;
        let uri = uri.into();
        info!(uri = %uri, backend = objects.backend_name(), "opened binary cache store");
        Ok(Arc::new(Self {
            objects,
            store_dir,
            uri,
            state: StoreState::new(config, disk_cache),
            trusted_keys,
            signer,
            // remote caches are preferred over rebuilding but yield to local
            priority: 10,
        }))
    }

    fn info_key(path: &StorePath) -> String {
        format!("{}.narinfo", path.hash_part())
    }

    fn nar_key(path: &StorePath) -> String {
        format!("nar/{}.nar", path.hash_part())
    }
}

#[async_trait]
impl<O: ObjectStore> Store for BinaryCacheStore<O> {
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
        self.priority
    }

    async fn query_path_info_uncached(&self, path: &StorePath) -> Result<Option<ValidPathInfo>> {
        let text = match self.objects.get(&Self::info_key(path)).await? {
            None => return Ok(None),
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::Format("path info is not UTF-8".into()))?,
        };
        ValidPathInfo::parse_text(&self.store_dir, &text).map(Some)
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

        if !repair && self.objects.exists(&Self::info_key(&info.path)).await? {
            debug!(path = %printed, "path already in cache");
            return Ok(());
        }

        if check_sigs && !info.is_content_addressed(&self.store_dir)? {
            let fingerprint = info.fingerprint(&self.store_dir)?;
            if !verify_any(&fingerprint, &info.sigs, &self.trusted_keys) {
                return Err(Error::Signature(printed));
            }
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

        self.objects
            .put(&Self::nar_key(&info.path), Bytes::from(data))
            .await?;

        let mut stored = info.clone();
        if let Some(signer) = &self.signer {
            signer.sign(&self.store_dir, &mut stored)?;
        }
        self.objects
            .put(
                &Self::info_key(&info.path),
                Bytes::from(stored.to_text(&self.store_dir)),
            )
            .await?;

        self.state
            .cache
            .insert_present(info.path.hash_part().as_str(), Arc::new(stored));
        info!(path = %printed, bytes = got_size, "path uploaded to cache");
        Ok(())
    }

    async fn nar_from_path(&self, path: &StorePath) -> Result<ByteStream> {
        // make sure the info exists first so absence surfaces as InvalidPath
        self.query_path_info(path.into()).await?;
        match self.objects.get_stream(&Self::nar_key(path)).await? {
            Some(stream) => Ok(stream),
            None => Err(Error::InvalidPath(self.store_dir.print_path(path))),
        }
    }

    async fn query_path_from_hash_part(&self, hash_part: &str) -> Result<Option<StorePath>> {
        let text = match self.objects.get(&format!("{hash_part}.narinfo")).await? {
            None => return Ok(None),
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::Format("path info is not UTF-8".into()))?,
        };
        let info = ValidPathInfo::parse_text(&self.store_dir, &text)?;
        Ok(Some(info.path))
    }
}

/// Re-export used by the dispatcher for `file://` URIs.
pub use crate::object_store::FsObjectStore;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryObjectStore;
    use keg_core::hash::{Algorithm, Hash};

    fn sample_info(data: &[u8]) -> ValidPathInfo {
        let path = StorePath::from_basename("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg").unwrap();
        ValidPathInfo::new(path, Hash::of(Algorithm::Sha256, data), data.len() as u64)
    }

    #[tokio::test]
    async fn test_add_query_nar_roundtrip() {
        let store = BinaryCacheStore::open(
            MemoryObjectStore::new(),
            "memory://test",
            &StoreConfig::default(),
            None,
        )
        .await
        .unwrap();

        let data = b"serialized tree";
        let info = sample_info(data);
        store
            .add_to_store(&info, once_stream(Bytes::from_static(data)), false, false)
            .await
            .unwrap();

        let got = store.query_path_info((&info.path).into()).await.unwrap();
        assert_eq!(got.nar_hash, info.nar_hash);

        let nar = store.nar_from_path(&info.path).await.unwrap();
        assert_eq!(&crate::stream::collect(nar).await.unwrap()[..], data);
    }

    #[tokio::test]
    async fn test_hash_mismatch_rejected() {
        let store = BinaryCacheStore::open(
            MemoryObjectStore::new(),
            "memory://test",
            &StoreConfig::default(),
            None,
        )
        .await
        .unwrap();

        let info = sample_info(b"expected bytes");
        let result = store
            .add_to_store(
                &info,
                once_stream(Bytes::from_static(b"different bytes")),
                false,
                false,
            )
            .await;
        assert!(matches!(result, Err(Error::HashMismatch { .. })));
    }

    #[tokio::test]
    async fn test_signer_signs_uploads() {
        let signer = StoreSigner::generate("cache-key-1");
        let store = BinaryCacheStore::open(
            MemoryObjectStore::new(),
            "memory://test",
            &StoreConfig::default(),
            Some(signer),
        )
        .await
        .unwrap();

        let data = b"tree";
        let info = sample_info(data);
        store
            .add_to_store(&info, once_stream(Bytes::from_static(data)), false, false)
            .await
            .unwrap();

        let got = store.query_path_info((&info.path).into()).await.unwrap();
        assert_eq!(got.sigs.len(), 1);
        assert_eq!(got.sigs.iter().next().unwrap().key_name, "cache-key-1");
    }

    #[tokio::test]
    async fn test_unsigned_upload_rejected_when_checking() {
        let store = BinaryCacheStore::open(
            MemoryObjectStore::new(),
            "memory://test",
            &StoreConfig::default(),
            None,
        )
        .await
        .unwrap();

        let data = b"tree";
        let info = sample_info(data);
        let result = store
            .add_to_store(&info, once_stream(Bytes::from_static(data)), false, true)
            .await;
        assert!(matches!(result, Err(Error::Signature(_))));
    }

    #[tokio::test]
    async fn test_query_path_from_hash_part() {
        let store = BinaryCacheStore::open(
            MemoryObjectStore::new(),
            "memory://test",
            &StoreConfig::default(),
            None,
        )
        .await
        .unwrap();

        let data = b"tree";
        let info = sample_info(data);
        store
            .add_to_store(&info, once_stream(Bytes::from_static(data)), false, false)
            .await
            .unwrap();

        let got = store
            .query_path_from_hash_part(info.path.hash_part().as_str())
            .await
            .unwrap();
        assert_eq!(got, Some(info.path));
    }
}
