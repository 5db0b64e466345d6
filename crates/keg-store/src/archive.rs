//! Tree archiver interface.
//!
//! The canonical directory serializer (the archive byte format) is an
//! external collaborator; the store only needs a way to turn a filesystem
//! tree into a canonical byte stream and back.

use crate::stream::ByteStream;
use async_trait::async_trait;
use futures::StreamExt;
use keg_core::{Error, Result};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Serializes filesystem trees to canonical byte streams and restores them.
#[async_trait]
pub trait TreeArchiver: Send + Sync + 'static {
    /// Serialize the tree at `path`.
    async fn dump(&self, path: &Path) -> Result<ByteStream>;

    /// Restore a serialized tree to `path`.
    async fn restore(&self, source: ByteStream, path: &Path) -> Result<()>;
}

/// Chunk size for dump reads (64 KiB).
const DUMP_CHUNK_SIZE: usize = 64 * 1024;

/// Single-file passthrough archiver: the serialization of a regular file is
/// its contents. Stands in for the real serializer wherever artifacts are
/// single files (and in tests).
pub struct FlatArchiver;

#[async_trait]
impl TreeArchiver for FlatArchiver {
    async fn dump(&self, path: &Path) -> Result<ByteStream> {
        let file = tokio::fs::File::open(path).await?;
        let stream = tokio_util::io::ReaderStream::with_capacity(file, DUMP_CHUNK_SIZE)
            .map(|chunk| chunk.map_err(Error::Io));
        Ok(Box::pin(stream))
    }

    async fn restore(&self, mut source: ByteStream, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        while let Some(chunk) = source.next().await {
            crate::interrupt::check_interrupt()?;
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream;

    #[tokio::test]
    async fn test_flat_archiver_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("artifact");
        tokio::fs::write(&src, b"artifact bytes").await.unwrap();

        let archiver = FlatArchiver;
        let dumped = archiver.dump(&src).await.unwrap();
        let bytes = stream::collect(dumped).await.unwrap();
        assert_eq!(&bytes[..], b"artifact bytes");

        let dst = dir.path().join("restored/artifact");
        archiver
            .restore(stream::once_stream(bytes), &dst)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"artifact bytes");
    }

    #[tokio::test]
    async fn test_dump_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FlatArchiver.dump(&dir.path().join("absent")).await.is_err());
    }
}
