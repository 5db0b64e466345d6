#![allow(dead_code)]

use bytes::Bytes;
use keg_core::hash::{Algorithm, Hash};
use keg_core::store_path::{StorePath, StorePathName};
use keg_core::ValidPathInfo;
use keg_store::stream::once_stream;
use keg_store::{FlatArchiver, LocalStore, Store, StoreConfig, StoreParams};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Open a local store rooted in a scratch directory.
pub async fn open_local(root: &Path, config: &StoreConfig) -> Arc<LocalStore> {
    let mut params = StoreParams::new();
    params.insert("root".to_string(), root.to_string_lossy().into_owned());
    LocalStore::open(config, &params, Arc::new(FlatArchiver))
        .await
        .unwrap()
}

/// Register an input-addressed artifact (an `output:out` path) carrying
/// `data` and the given references. References must already be valid.
pub async fn add_blob(
    store: &LocalStore,
    name: &str,
    data: &[u8],
    references: BTreeSet<StorePath>,
) -> StorePath {
    let info = blob_info(store, name, data, references);
    store
        .add_to_store(&info, once_stream(Bytes::copy_from_slice(data)), false, false)
        .await
        .unwrap();
    info.path
}

/// Build (but do not register) the path info `add_blob` would register.
pub fn blob_info(
    store: &LocalStore,
    name: &str,
    data: &[u8],
    references: BTreeSet<StorePath>,
) -> ValidPathInfo {
    let name = StorePathName::new(name).unwrap();
    let content_hash = Hash::of(Algorithm::Sha256, data);
    let path = store
        .store_dir()
        .make_store_path("output:out", &content_hash, &name)
        .unwrap();
    let mut info = ValidPathInfo::new(path, Hash::of(Algorithm::Sha256, data), data.len() as u64);
    info.set_references_possibly_to_self(references);
    info
}
