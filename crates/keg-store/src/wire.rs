//! Wire framing for the serve protocol.
//!
//! Integers are 64-bit little-endian; strings are length-prefixed and
//! zero-padded to an 8-byte boundary; byte payloads travel as a sequence of
//! length-prefixed frames terminated by an empty frame.

use bytes::Bytes;
use keg_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SERVE_MAGIC_1: u64 = 0x390c_9deb;
pub const SERVE_MAGIC_2: u64 = 0x5452_eecb;
pub const PROTOCOL_VERSION: u64 = 0x205;

/// Upper bound on a single string or frame (256 MiB) to keep a broken peer
/// from demanding absurd allocations.
const MAX_FRAME: u64 = 256 * 1024 * 1024;

pub fn protocol_major(version: u64) -> u64 {
    version & 0xff00
}

pub fn protocol_minor(version: u64) -> u64 {
    version & 0x00ff
}

/// Serve protocol operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Command {
    QueryValidPaths = 1,
    QueryPathInfos = 2,
    DumpStorePath = 3,
    AddToStoreNar = 9,
}

pub async fn write_u64<W: AsyncWrite + Unpin>(w: &mut W, n: u64) -> Result<()> {
    w.write_all(&n.to_le_bytes()).await?;
    Ok(())
}

pub async fn read_u64<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await.map_err(eof)?;
    Ok(u64::from_le_bytes(buf))
}

pub async fn write_command<W: AsyncWrite + Unpin>(w: &mut W, command: Command) -> Result<()> {
    write_u64(w, command as u64).await
}

pub async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<()> {
    write_bytes(w, s.as_bytes()).await
}

pub async fn write_bytes<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    write_u64(w, data.len() as u64).await?;
    w.write_all(data).await?;
    let pad = padding(data.len());
    if pad > 0 {
        w.write_all(&[0u8; 8][..pad]).await?;
    }
    Ok(())
}

pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let bytes = read_bytes(r).await?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Format("wire string is not UTF-8".into()))
}

pub async fn read_bytes<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = read_u64(r).await?;
    if len > MAX_FRAME {
        return Err(Error::ProtocolMismatch(format!(
            "peer sent an oversized frame ({len} bytes)"
        )));
    }
    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data).await.map_err(eof)?;
    let pad = padding(len as usize);
    if pad > 0 {
        let mut padding_buf = [0u8; 8];
        r.read_exact(&mut padding_buf[..pad]).await.map_err(eof)?;
        if padding_buf[..pad].iter().any(|&b| b != 0) {
            return Err(Error::Format("non-zero wire padding".into()));
        }
    }
    Ok(Bytes::from(data))
}

pub async fn write_string_list<W, I>(w: &mut W, items: I) -> Result<()>
where
    W: AsyncWrite + Unpin,
    I: ExactSizeIterator<Item = impl AsRef<str>>,
{
    write_u64(w, items.len() as u64).await?;
    for item in items {
        write_string(w, item.as_ref()).await?;
    }
    Ok(())
}

pub async fn read_string_list<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<String>> {
    let count = read_u64(r).await?;
    if count > MAX_FRAME / 8 {
        return Err(Error::ProtocolMismatch(format!(
            "peer sent an oversized list ({count} items)"
        )));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(read_string(r).await?);
    }
    Ok(out)
}

/// Write a payload as frames, ending with the empty frame.
pub async fn write_framed<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    for chunk in data.chunks(64 * 1024) {
        write_u64(w, chunk.len() as u64).await?;
        w.write_all(chunk).await?;
    }
    write_u64(w, 0).await?;
    Ok(())
}

/// Read frames until the empty terminator.
pub async fn read_framed<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        crate::interrupt::check_interrupt()?;
        let len = read_u64(r).await?;
        if len == 0 {
            return Ok(out);
        }
        if len > MAX_FRAME {
            return Err(Error::ProtocolMismatch(format!(
                "peer sent an oversized frame ({len} bytes)"
            )));
        }
        let start = out.len();
        out.resize(start + len as usize, 0);
        r.read_exact(&mut out[start..]).await.map_err(eof)?;
    }
}

fn padding(len: usize) -> usize {
    (8 - len % 8) % 8
}

fn eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::EndOfFile("peer closed the connection mid-message".into())
    } else {
        Error::Io(e)
    }
}
