//! Byte streams, pipes, and hashing sinks.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use keg_core::hash::{Algorithm, Hash, Hasher};
use keg_core::{Error, Result};
use std::pin::Pin;
use tokio::sync::mpsc;

/// A boxed stream of byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Wrap a single buffer as a stream.
pub fn once_stream(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Collect a stream into one buffer, polling the interrupt flag per chunk.
pub async fn collect(mut stream: ByteStream) -> Result<Bytes> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        crate::interrupt::check_interrupt()?;
        out.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(out))
}

/// Producer half of a bounded byte pipe.
///
/// The producer blocks when the channel is full; dropping the consumer makes
/// further sends fail; an error sent by the producer is delivered to the
/// consumer in stream position.
pub struct PipeWriter {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl PipeWriter {
    /// Send one chunk downstream.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.tx
            .send(Ok(data))
            .await
            .map_err(|_| Error::EndOfFile("pipe consumer went away".into()))
    }

    /// Deliver an error to the consumer and close the pipe.
    pub async fn fail(self, error: Error) {
        let _ = self.tx.send(Err(error)).await;
    }
}

/// A bounded pipe between a producer task and a consumer stream.
/// `capacity` is in chunks. End-of-stream is seen exactly once, when the
/// writer is dropped.
pub fn pipe(capacity: usize) -> (PipeWriter, ByteStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    (PipeWriter { tx }, Box::pin(stream))
}

/// Hashes bytes as they pass through, counting them.
pub struct HashSink {
    hasher: Hasher,
    size: u64,
}

impl HashSink {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            hasher: Hasher::new(algorithm),
            size: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size += data.len() as u64;
    }

    pub fn finish(self) -> (Hash, u64) {
        (self.hasher.finish(), self.size)
    }
}

/// Hashes bytes with every occurrence of a modulus string replaced by an
/// equal-length run of `'='`.
///
/// Used to hash self-referencing artifacts: the artifact's own hash part is
/// rewritten out, so the digest is stable wherever the artifact lands.
pub struct HashModuloSink {
    hasher: Hasher,
    modulus: Vec<u8>,
    /// Unhashed tail that may still hold a modulus prefix.
    carry: Vec<u8>,
    size: u64,
}

impl HashModuloSink {
    pub fn new(algorithm: Algorithm, modulus: &str) -> Self {
        Self {
            hasher: Hasher::new(algorithm),
            modulus: modulus.as_bytes().to_vec(),
            carry: Vec::new(),
            size: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        let m = self.modulus.len();
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(data);

        let mut i = 0;
        while i + m <= buf.len() {
            if buf[i..i + m] == self.modulus[..] {
                buf[i..i + m].fill(b'=');
                i += m;
            } else {
                i += 1;
            }
        }

        // keep the last m-1 bytes: a match could span the chunk boundary
        let keep = m.saturating_sub(1).min(buf.len());
        let hash_upto = buf.len() - keep;
        self.hasher.update(&buf[..hash_upto]);
        self.carry = buf[hash_upto..].to_vec();
    }

    pub fn finish(mut self) -> (Hash, u64) {
        let carry = std::mem::take(&mut self.carry);
        self.hasher.update(&carry);
        (self.hasher.finish(), self.size)
    }
}

/// Hash serialized-tree bytes for a path info: plain SHA-256, or modulo the
/// path's own hash part when a content-addressed artifact references
/// itself. Both registration and verification go through this, so the two
/// sides always agree.
pub fn hash_nar_for_info(info: &keg_core::ValidPathInfo, data: &[u8]) -> (Hash, u64) {
    if info.ca.is_some() && info.references.has_self_reference {
        let mut sink = HashModuloSink::new(Algorithm::Sha256, info.path.hash_part().as_str());
        sink.update(data);
        sink.finish()
    } else {
        let mut sink = HashSink::new(Algorithm::Sha256);
        sink.update(data);
        sink.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_delivers_in_order() {
        let (writer, stream) = pipe(2);
        let producer = tokio::spawn(async move {
            writer.send(Bytes::from_static(b"hello ")).await.unwrap();
            writer.send(Bytes::from_static(b"world")).await.unwrap();
        });
        let collected = collect(stream).await.unwrap();
        assert_eq!(&collected[..], b"hello world");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_propagates_error() {
        let (writer, stream) = pipe(1);
        tokio::spawn(async move {
            writer.send(Bytes::from_static(b"partial")).await.unwrap();
            writer.fail(Error::EndOfFile("truncated".into())).await;
        });
        assert!(matches!(collect(stream).await, Err(Error::EndOfFile(_))));
    }

    #[tokio::test]
    async fn test_pipe_send_fails_after_consumer_drop() {
        let (writer, stream) = pipe(1);
        drop(stream);
        assert!(writer.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[test]
    fn test_hash_sink_matches_one_shot() {
        let mut sink = HashSink::new(Algorithm::Sha256);
        sink.update(b"hello ");
        sink.update(b"world");
        let (hash, size) = sink.finish();
        assert_eq!(hash, Hash::of(Algorithm::Sha256, b"hello world"));
        assert_eq!(size, 11);
    }

    #[test]
    fn test_hash_modulo_replaces_occurrences() {
        let modulus = "selfselfself";
        let data = format!("prefix {modulus} middle {modulus} suffix");
        let rewritten = data.replace(modulus, &"=".repeat(modulus.len()));

        let mut sink = HashModuloSink::new(Algorithm::Sha256, modulus);
        sink.update(data.as_bytes());
        let (hash, size) = sink.finish();
        assert_eq!(hash, Hash::of(Algorithm::Sha256, rewritten.as_bytes()));
        assert_eq!(size, data.len() as u64);
    }

    #[test]
    fn test_hash_modulo_match_across_chunk_boundary() {
        let modulus = "abcdef";
        let data = b"xxabcdefyy";
        let rewritten = b"xx======yy";

        // split inside the modulus occurrence
        for split in 1..data.len() {
            let mut sink = HashModuloSink::new(Algorithm::Sha256, modulus);
            sink.update(&data[..split]);
            sink.update(&data[split..]);
            let (hash, _) = sink.finish();
            assert_eq!(
                hash,
                Hash::of(Algorithm::Sha256, rewritten),
                "failed at split {split}"
            );
        }
    }

    #[test]
    fn test_hash_modulo_without_occurrence_is_plain_hash() {
        let mut sink = HashModuloSink::new(Algorithm::Sha256, "needle");
        sink.update(b"haystack without it");
        let (hash, _) = sink.finish();
        assert_eq!(hash, Hash::of(Algorithm::Sha256, b"haystack without it"));
    }
}
