//! Remote stores speaking the serve protocol over a pooled transport.
//!
//! The transport is pluggable: an SSH child process for `ssh://` stores, a
//! Unix socket for the local daemon, an in-memory duplex in tests. A
//! connection that sees any I/O error is marked bad and discarded on
//! return.

use crate::config::{StoreConfig, StoreParams};
use crate::interrupt::check_interrupt;
use crate::pool::Pool;
use crate::stream::{once_stream, ByteStream};
use crate::traits::{Store, StoreState};
use crate::wire;
use async_trait::async_trait;
use futures::future::BoxFuture;
use keg_core::content_address::ContentAddress;
use keg_core::hash::{Algorithm, Hash};
use keg_core::store_path::{StoreDir, StorePath};
use keg_core::{Error, Result, ValidPathInfo};
use std::collections::BTreeSet;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// A bidirectional byte transport.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxTransport = Box<dyn Transport>;

/// Opens fresh transports on demand.
pub type TransportFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<BoxTransport>> + Send + Sync>;

/// A live, handshaken connection.
pub struct Connection {
    io: BoxTransport,
    remote_version: u64,
}

/// A store reached over the serve protocol.
pub struct RemoteStore {
    store_dir: StoreDir,
    uri: String,
    state: StoreState,
    factory: TransportFactory,
    pool: Pool<Connection>,
    remote_version: AtomicU64,
}

impl RemoteStore {
    /// Open an `ssh://host` store. The remote side runs
    /// `<remote-program> --serve --write`.
    pub async fn open_ssh(
        host: &str,
        config: &StoreConfig,
        params: &StoreParams,
    ) -> Result<Arc<Self>> {
        let host = host.to_string();
        let program = params
            .get("remote-program")
            .cloned()
            .unwrap_or_else(|| "keg-store".to_string());
        let ssh_key = params.get("ssh-key").cloned();

        let factory_host = host.clone();
        let factory: TransportFactory = Arc::new(move || {
            let host = factory_host.clone();
            let program = program.clone();
            let ssh_key = ssh_key.clone();
            Box::pin(async move { spawn_ssh(&host, &program, ssh_key.as_deref()).await })
        });

        let disk_cache = crate::traits::open_disk_cache(config).await?;
        Self::new(format!("ssh://{host}"), factory, config, disk_cache)
    }

    /// Open the local daemon store over its Unix socket.
    pub async fn open_daemon(socket_path: &str, config: &StoreConfig) -> Result<Arc<Self>> {
        let socket_path = socket_path.to_string();
        let factory: TransportFactory = Arc::new(move || {
            let socket_path = socket_path.clone();
            Box::pin(async move {
                let stream = UnixStream::connect(&socket_path).await?;
                Ok(Box::new(stream) as BoxTransport)
            })
        });
        let disk_cache = crate::traits::open_disk_cache(config).await?;
        Self::new("daemon".to_string(), factory, config, disk_cache)
    }

    /// Build a remote store over an arbitrary transport factory.
    pub fn new(
        uri: String,
        factory: TransportFactory,
        config: &StoreConfig,
        disk_cache: Option<Arc<keg_registry::DiskCache>>,
    ) -> Result<Arc<Self>> {
        info!(uri = %uri, "opened remote store");
        Ok(Arc::new(Self {
            store_dir: config.store_dir()?,
            uri,
            state: StoreState::new(config, disk_cache),
            factory,
            pool: Pool::new(config.max_connections),
            remote_version: AtomicU64::new(0),
        }))
    }

    async fn connection(&self) -> Result<crate::pool::PoolGuard<'_, Connection>> {
        let factory = Arc::clone(&self.factory);
        let uri = self.uri.clone();
        let guard = self
            .pool
            .get(|| async move {
                let io = factory().await?;
                handshake(io, &uri).await
            })
            .await?;
        self.remote_version
            .store(guard.remote_version, Ordering::Relaxed);
        Ok(guard)
    }

    /// Whether an error means the connection can no longer be trusted.
    fn poisons_connection(error: &Error) -> bool {
        matches!(
            error,
            Error::Io(_) | Error::EndOfFile(_) | Error::ProtocolMismatch(_) | Error::Format(_)
        )
    }

    async fn query_path_info_op(
        &self,
        conn: &mut Connection,
        path: &StorePath,
    ) -> Result<Option<ValidPathInfo>> {
        let io = &mut conn.io;
        wire::write_command(io, wire::Command::QueryPathInfos).await?;
        wire::write_string_list(io, [self.store_dir.print_path(path)].iter()).await?;
        io.flush().await?;

        let answered = wire::read_string(io).await?;
        if answered.is_empty() {
            return Ok(None);
        }
        let answered_path = self.store_dir.parse_path(&answered)?;

        let deriver = wire::read_string(io).await?;
        let references = wire::read_string_list(io).await?;
        let nar_size = wire::read_u64(io).await?;
        let nar_hash = Hash::parse(&wire::read_string(io).await?, Some(Algorithm::Sha256))?;
        let ca = ContentAddress::parse_opt(&wire::read_string(io).await?)?;
        let sigs = wire::read_string_list(io).await?;
        let terminator = wire::read_string(io).await?;
        if !terminator.is_empty() {
            return Err(Error::ProtocolMismatch(self.uri.clone()));
        }

        let mut info = ValidPathInfo::new(answered_path, nar_hash, nar_size);
        if !deriver.is_empty() {
            info.deriver = Some(self.store_dir.parse_path(&deriver)?);
        }
        let mut flattened = BTreeSet::new();
        for reference in references {
            flattened.insert(self.store_dir.parse_path(&reference)?);
        }
        info.set_references_possibly_to_self(flattened);
        for sig in sigs {
            info.sigs.insert(keg_core::Signature::parse(&sig)?);
        }
        info.ca = ca;
        Ok(Some(info))
    }
}

#[async_trait]
impl Store for RemoteStore {
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
        20
    }

    fn protocol_version(&self) -> Option<u64> {
        match self.remote_version.load(Ordering::Relaxed) {
            0 => None,
            version => Some(version),
        }
    }

    async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn query_path_info_uncached(&self, path: &StorePath) -> Result<Option<ValidPathInfo>> {
        debug!(uri = %self.uri, path = %path, "querying remote for path info");
        let mut conn = self.connection().await?;
        match self.query_path_info_op(&mut conn, path).await {
            Ok(found) => Ok(found),
            Err(e) => {
                if Self::poisons_connection(&e) {
                    conn.mark_bad();
                }
                Err(e)
            }
        }
    }

    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
        substitute: bool,
    ) -> Result<BTreeSet<StorePath>> {
        check_interrupt()?;
        let mut conn = self.connection().await?;
        let result = async {
            let io = &mut conn.io;
            wire::write_command(io, wire::Command::QueryValidPaths).await?;
            wire::write_u64(io, 0).await?; // lock
            wire::write_u64(io, u64::from(substitute)).await?;
            let printed: Vec<String> =
                paths.iter().map(|p| self.store_dir.print_path(p)).collect();
            wire::write_string_list(io, printed.iter()).await?;
            io.flush().await?;

            let mut valid = BTreeSet::new();
            for path in wire::read_string_list(io).await? {
                valid.insert(self.store_dir.parse_path(&path)?);
            }
            Ok(valid)
        }
        .await;
        if let Err(e) = &result {
            if Self::poisons_connection(e) {
                conn.mark_bad();
            }
        }
        result
    }

    async fn add_to_store(
        &self,
        info: &ValidPathInfo,
        source: ByteStream,
        _repair: bool,
        _check_sigs: bool,
    ) -> Result<()> {
        check_interrupt()?;
        let data = crate::stream::collect(source).await?;

        let mut conn = self.connection().await?;
        let result = async {
            let io = &mut conn.io;
            wire::write_command(io, wire::Command::AddToStoreNar).await?;
            wire::write_string(io, &self.store_dir.print_path(&info.path)).await?;
            wire::write_string(
                io,
                &info
                    .deriver
                    .as_ref()
                    .map(|d| self.store_dir.print_path(d))
                    .unwrap_or_default(),
            )
            .await?;
            wire::write_string(io, &info.nar_hash.to_text(keg_core::HashEncoding::Base32, true))
                .await?;
            let references: Vec<String> = info
                .references_possibly_to_self()
                .iter()
                .map(|r| self.store_dir.print_path(r))
                .collect();
            wire::write_string_list(io, references.iter()).await?;
            wire::write_u64(io, info.registration_time as u64).await?;
            wire::write_u64(io, info.nar_size).await?;
            wire::write_u64(io, u64::from(info.ultimate)).await?;
            let sigs: Vec<String> = info.sigs.iter().map(ToString::to_string).collect();
            wire::write_string_list(io, sigs.iter()).await?;
            wire::write_string(io, &ContentAddress::render_opt(&info.ca)).await?;
            wire::write_framed(io, &data).await?;
            io.flush().await?;

            match wire::read_u64(io).await? {
                1 => Ok(()),
                _ => {
                    let message = wire::read_string(io).await?;
                    Err(Error::Other(format!(
                        "remote store '{}' rejected path: {message}",
                        self.uri
                    )))
                }
            }
        }
        .await;
        if let Err(e) = &result {
            if Self::poisons_connection(e) {
                conn.mark_bad();
            }
        }
        result
    }

    async fn nar_from_path(&self, path: &StorePath) -> Result<ByteStream> {
        check_interrupt()?;
        let mut conn = self.connection().await?;
        let result = async {
            let io = &mut conn.io;
            wire::write_command(io, wire::Command::DumpStorePath).await?;
            wire::write_string(io, &self.store_dir.print_path(path)).await?;
            io.flush().await?;

            match wire::read_u64(io).await? {
                1 => Ok(bytes::Bytes::from(wire::read_framed(io).await?)),
                _ => Err(Error::InvalidPath(self.store_dir.print_path(path))),
            }
        }
        .await;
        match result {
            Ok(data) => Ok(once_stream(data)),
            Err(e) => {
                if Self::poisons_connection(&e) {
                    conn.mark_bad();
                }
                Err(e)
            }
        }
    }
}

/// Handshake: exchange magics and agree on a protocol version.
pub async fn handshake(mut io: BoxTransport, uri: &str) -> Result<Connection> {
    wire::write_u64(&mut io, wire::SERVE_MAGIC_1).await?;
    wire::write_u64(&mut io, wire::PROTOCOL_VERSION).await?;
    io.flush().await?;

    let magic = wire::read_u64(&mut io).await?;
    if magic != wire::SERVE_MAGIC_2 {
        return Err(Error::ProtocolMismatch(uri.to_string()));
    }
    let remote_version = wire::read_u64(&mut io).await?;
    if wire::protocol_major(remote_version) != wire::protocol_major(wire::PROTOCOL_VERSION) {
        warn!(
            uri,
            remote_version, "remote speaks an incompatible protocol major version"
        );
        return Err(Error::ProtocolMismatch(uri.to_string()));
    }
    Ok(Connection { io, remote_version })
}

/// Transport over an `ssh` child process.
pub struct ProcessTransport {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for ProcessTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProcessTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

async fn spawn_ssh(host: &str, program: &str, ssh_key: Option<&str>) -> Result<BoxTransport> {
    let mut command = Command::new("ssh");
    if let Some(key) = ssh_key {
        command.arg("-i").arg(key);
    }
    command
        .arg("-x")
        .arg("-a")
        .arg(host)
        .arg("--")
        .arg(program)
        .arg("--serve")
        .arg("--write")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = command.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Other("ssh child has no stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Other("ssh child has no stdout".into()))?;
    Ok(Box::new(ProcessTransport {
        _child: child,
        stdin,
        stdout,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{SERVE_MAGIC_1, SERVE_MAGIC_2};

    fn duplex_factory(
        serve: impl Fn(tokio::io::DuplexStream) + Send + Sync + 'static,
    ) -> TransportFactory {
        let serve = Arc::new(serve);
        Arc::new(move || {
            let (client, server) = tokio::io::duplex(64 * 1024);
            serve(server);
            Box::pin(async move { Ok(Box::new(client) as BoxTransport) })
        })
    }

    async fn serve_handshake(io: &mut tokio::io::DuplexStream) {
        let magic = wire::read_u64(io).await.unwrap();
        assert_eq!(magic, SERVE_MAGIC_1);
        let _client_version = wire::read_u64(io).await.unwrap();
        wire::write_u64(io, SERVE_MAGIC_2).await.unwrap();
        wire::write_u64(io, wire::PROTOCOL_VERSION).await.unwrap();
        io.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_and_version() {
        let factory = duplex_factory(|mut server| {
            tokio::spawn(async move {
                serve_handshake(&mut server).await;
            });
        });
        let store = RemoteStore::new("test://peer".into(), factory, &StoreConfig::default(), None).unwrap();
        store.connect().await.unwrap();
        assert_eq!(store.protocol_version(), Some(wire::PROTOCOL_VERSION));
    }

    #[tokio::test]
    async fn test_bad_magic_is_protocol_mismatch() {
        let factory = duplex_factory(|mut server| {
            tokio::spawn(async move {
                let _ = wire::read_u64(&mut server).await;
                let _ = wire::read_u64(&mut server).await;
                wire::write_u64(&mut server, 0x1234).await.unwrap();
                wire::write_u64(&mut server, wire::PROTOCOL_VERSION).await.unwrap();
            });
        });
        let store = RemoteStore::new("test://peer".into(), factory, &StoreConfig::default(), None).unwrap();
        assert!(matches!(
            store.connect().await,
            Err(Error::ProtocolMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_query_path_info_miss() {
        let factory = duplex_factory(|mut server| {
            tokio::spawn(async move {
                serve_handshake(&mut server).await;
                let command = wire::read_u64(&mut server).await.unwrap();
                assert_eq!(command, wire::Command::QueryPathInfos as u64);
                let paths = wire::read_string_list(&mut server).await.unwrap();
                assert_eq!(paths.len(), 1);
                wire::write_string(&mut server, "").await.unwrap();
                server.flush().await.unwrap();
            });
        });
        let store = RemoteStore::new("test://peer".into(), factory, &StoreConfig::default(), None).unwrap();
        let path = StorePath::from_basename("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg").unwrap();
        let found = store.query_path_info_uncached(&path).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_query_path_info_hit() {
        let factory = duplex_factory(|mut server| {
            tokio::spawn(async move {
                serve_handshake(&mut server).await;
                let _command = wire::read_u64(&mut server).await.unwrap();
                let paths = wire::read_string_list(&mut server).await.unwrap();
                let path = &paths[0];
                wire::write_string(&mut server, path).await.unwrap();
                wire::write_string(&mut server, "").await.unwrap(); // deriver
                wire::write_string_list(&mut server, std::iter::empty::<&str>()) // refs
                    .await
                    .unwrap();
                wire::write_u64(&mut server, 7).await.unwrap(); // nar size
                let nar_hash = Hash::of(Algorithm::Sha256, b"nar");
                wire::write_string(
                    &mut server,
                    &nar_hash.to_text(keg_core::HashEncoding::Base32, true),
                )
                .await
                .unwrap();
                wire::write_string(&mut server, "").await.unwrap(); // ca
                wire::write_string_list(&mut server, std::iter::empty::<&str>()) // sigs
                    .await
                    .unwrap();
                wire::write_string(&mut server, "").await.unwrap(); // terminator
                server.flush().await.unwrap();
            });
        });
        let store = RemoteStore::new("test://peer".into(), factory, &StoreConfig::default(), None).unwrap();
        let path = StorePath::from_basename("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg").unwrap();
        let info = store.query_path_info_uncached(&path).await.unwrap().unwrap();
        assert_eq!(info.path, path);
        assert_eq!(info.nar_size, 7);
    }

    #[tokio::test]
    async fn test_truncated_response_marks_connection_bad() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let opened = Arc::new(AtomicUsize::new(0));
        let opened2 = Arc::clone(&opened);
        let factory = duplex_factory(move |mut server| {
            opened2.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                serve_handshake(&mut server).await;
                let _ = wire::read_u64(&mut server).await;
                let _ = wire::read_string_list(&mut server).await;
                // hang up mid-response
                drop(server);
            });
        });
        let store = RemoteStore::new("test://peer".into(), factory, &StoreConfig::default(), None).unwrap();
        let path = StorePath::from_basename("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg").unwrap();

        let first = store.query_path_info_uncached(&path).await;
        assert!(matches!(first, Err(Error::EndOfFile(_))));
        let second = store.query_path_info_uncached(&path).await;
        assert!(second.is_err());
        // the poisoned connection was not reused
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }
}
