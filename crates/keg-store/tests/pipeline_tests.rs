// The query pipeline: negative caching, promotion, fan-out filtering.

mod common;

use common::{add_blob, blob_info, open_local};
use keg_core::{Error, StorePath};
use keg_store::stream::once_stream;
use keg_store::{Store, StoreConfig};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_negative_result_is_cached() {
    let config = StoreConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let store = open_local(dir.path(), &config).await;

    let ghost = StorePath::from_basename("gggggggggggggggggggggggggggggggg-ghost").unwrap();
    assert!(!store.is_valid_path((&ghost).into()).await.unwrap());
    let uncached_reads = store.state().stats.path_info_read.load(Ordering::Relaxed);

    // the second miss is answered from the cache
    assert!(!store.is_valid_path((&ghost).into()).await.unwrap());
    assert_eq!(
        store.state().stats.path_info_read.load(Ordering::Relaxed),
        uncached_reads
    );
    assert!(store.state().stats.path_info_read_averted.load(Ordering::Relaxed) > 0);
}

#[tokio::test]
async fn test_registration_promotes_negative_entry() {
    let config = StoreConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let store = open_local(dir.path(), &config).await;

    let info = blob_info(&store, "pkg", b"bytes", BTreeSet::new());
    // cache the absence first
    assert!(!store.is_valid_path((&info.path).into()).await.unwrap());

    // an explicit store operation promotes absent to present
    store
        .add_to_store(
            &info,
            once_stream(bytes::Bytes::from_static(b"bytes")),
            false,
            false,
        )
        .await
        .unwrap();
    assert!(store.is_valid_path((&info.path).into()).await.unwrap());
}

#[tokio::test]
async fn test_query_valid_paths_filters_invalid() {
    let config = StoreConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let store = open_local(dir.path(), &config).await;

    let real = add_blob(&store, "real", b"real bytes", BTreeSet::new()).await;
    let ghost = StorePath::from_basename("gggggggggggggggggggggggggggggggg-ghost").unwrap();

    let asked = BTreeSet::from([real.clone(), ghost]);
    let valid = store.query_valid_paths(&asked, false).await.unwrap();
    assert_eq!(valid, BTreeSet::from([real]));
}

#[tokio::test]
async fn test_query_path_info_error_kind() {
    let config = StoreConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let store = open_local(dir.path(), &config).await;

    let ghost = StorePath::from_basename("gggggggggggggggggggggggggggggggg-ghost").unwrap();
    let result = store.query_path_info((&ghost).into()).await;
    assert!(matches!(result, Err(Error::InvalidPath(_))));
}

#[tokio::test]
async fn test_query_path_from_hash_part() {
    let config = StoreConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let store = open_local(dir.path(), &config).await;

    let path = add_blob(&store, "pkg", b"bytes", BTreeSet::new()).await;
    let got = store
        .query_path_from_hash_part(path.hash_part().as_str())
        .await
        .unwrap();
    assert_eq!(got, Some(path));
}

#[tokio::test]
async fn test_add_ca_to_store_bakes_path() {
    let config = StoreConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let store = open_local(dir.path(), &config).await;

    let data = b"addressed by content";
    let ca = keg_core::ContentAddressWithReferences::Fixed(keg_core::FixedOutputInfo {
        method: keg_core::IngestionMethod::Recursive,
        hash: keg_core::Hash::of(keg_core::Algorithm::Sha256, data),
        references: Default::default(),
    });
    let path = keg_store::local::add_ca_to_store(
        &store,
        &keg_core::StorePathName::new("pkg").unwrap(),
        ca,
        bytes::Bytes::from_static(data),
    )
    .await
    .unwrap();

    let info = store.query_path_info((&path).into()).await.unwrap();
    assert!(info.is_content_addressed(store.store_dir()).unwrap());
}

#[tokio::test]
async fn test_disk_cache_survives_store_instances() {
    let cache_db = tempfile::tempdir().unwrap();
    let objects_dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        disk_cache_path: Some(
            cache_db
                .path()
                .join("lookups.sqlite")
                .to_string_lossy()
                .into_owned(),
        ),
        ..StoreConfig::default()
    };
    let uri = format!("file://{}", objects_dir.path().display());
    let ghost = StorePath::from_basename("gggggggggggggggggggggggggggggggg-ghost").unwrap();

    let dispatcher = keg_store::Dispatcher::new(config.clone());
    let first = dispatcher.open(&uri).await.unwrap();
    assert!(!first.is_valid_path((&ghost).into()).await.unwrap());
    assert_eq!(first.state().stats.path_info_read.load(Ordering::Relaxed), 1);

    // a fresh store instance has a cold LRU but a warm disk cache
    let second = dispatcher.open(&uri).await.unwrap();
    assert!(!second.is_valid_path((&ghost).into()).await.unwrap());
    assert_eq!(second.state().stats.path_info_read.load(Ordering::Relaxed), 0);
    assert_eq!(
        second
            .state()
            .stats
            .path_info_read_averted
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn test_delete_refused_while_referenced() {
    let config = StoreConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let store = open_local(dir.path(), &config).await;

    let dep = add_blob(&store, "dep", b"dep bytes", BTreeSet::new()).await;
    let _top = add_blob(&store, "top", b"top bytes", BTreeSet::from([dep.clone()])).await;

    assert!(store.delete_path(&dep).await.is_err());
}
