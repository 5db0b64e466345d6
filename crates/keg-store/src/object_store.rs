//! Object store abstraction backing binary-cache stores.

use crate::stream::{once_stream, ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use keg_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Flat keyed blob storage. HTTP and S3 clients sit behind this same trait;
/// the filesystem implementation ships here.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Fetch an object; `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Fetch an object as a stream; `None` when absent.
    async fn get_stream(&self, key: &str) -> Result<Option<ByteStream>>;

    /// Store an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete an object (absent objects are fine).
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Backend identifier for logs.
    fn backend_name(&self) -> &'static str;
}

/// Filesystem-backed object store (`file://` caches).
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key, rejecting anything that could escape the root.
    fn key_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.contains("..") {
            return Err(Error::Format(format!("invalid object key '{key}'")));
        }
        for component in Path::new(key).components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(Error::Format(format!("invalid object key '{key}'")));
            }
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.key_path(key)?).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.key_path(key)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn get_stream(&self, key: &str) -> Result<Option<ByteStream>> {
        use futures::StreamExt;
        match fs::File::open(self.key_path(key)?).await {
            Ok(file) => {
                let stream = tokio_util::io::ReaderStream::new(file)
                    .map(|chunk| chunk.map_err(Error::Io));
                Ok(Some(Box::pin(stream)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // write to a temp name, then rename into place
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        fs::rename(&tmp, &path).await?;
        debug!(key, bytes = data.len(), "object stored");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative.to_string_lossy().into_owned();
                    if key.starts_with(prefix) && !key.ends_with(".tmp") {
                        out.push(key);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

/// Ephemeral in-memory object store, for tests and scratch caches.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().expect("object map poisoned").contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.lock().expect("object map poisoned").get(key).cloned())
    }

    async fn get_stream(&self, key: &str) -> Result<Option<ByteStream>> {
        Ok(self.get(key).await?.map(once_stream))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects
            .lock()
            .expect("object map poisoned")
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().expect("object map poisoned").remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .expect("object map poisoned")
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_object_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();

        assert!(!store.exists("nar/abc.nar").await.unwrap());
        store
            .put("nar/abc.nar", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert!(store.exists("nar/abc.nar").await.unwrap());
        assert_eq!(
            store.get("nar/abc.nar").await.unwrap().unwrap(),
            Bytes::from_static(b"payload")
        );

        let keys = store.list("nar/").await.unwrap();
        assert_eq!(keys, vec!["nar/abc.nar".to_string()]);

        store.delete("nar/abc.nar").await.unwrap();
        assert!(store.get("nar/abc.nar").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_object_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path()).await.unwrap();
        assert!(store.get("../escape").await.is_err());
        assert!(store.get("/absolute").await.is_err());
        assert!(store.put("a/../../b", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_object_store() {
        let store = MemoryObjectStore::new();
        store.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"v"));
        assert_eq!(store.list("").await.unwrap(), vec!["k".to_string()]);
        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
    }
}
