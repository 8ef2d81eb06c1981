//! Local socket transport with length-prefixed JSON framing.
//!
//! Every envelope travels as a big-endian `u32` byte count followed by that
//! many bytes of JSON.

use peerlink_core::{IpcError, IpcResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

/// Largest envelope accepted from a peer.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Writes one framed message.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> IpcResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| IpcError::Protocol(format!("message of {} bytes is too large", payload.len())))?;

    writer.write_u32(len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message. `Ok(None)` means the peer closed the stream
/// cleanly between messages.
pub async fn read_frame<R, T>(reader: &mut R) -> IpcResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(IpcError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut buffer = vec![0u8; len as usize];
    reader.read_exact(&mut buffer).await?;
    Ok(Some(serde_json::from_slice(&buffer)?))
}

/// True when the error only means the other side went away.
pub fn is_disconnect(error: &IpcError) -> bool {
    match error {
        IpcError::Io(e) => matches!(
            e.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::UnexpectedEof
                | ErrorKind::NotConnected
        ),
        _ => false,
    }
}

/// Bound socket for one endpoint. The socket file is removed on drop.
#[derive(Debug)]
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub fn bind(path: &Path) -> io::Result<Self> {
        let inner = UnixListener::bind(path)?;
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> io::Result<Connection> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(Connection { stream })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Could not remove socket file");
        }
    }
}

/// One bidirectional, ordered message channel.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    pub async fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self { stream })
    }

    pub async fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> IpcResult<()> {
        write_frame(&mut self.stream, message).await
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> IpcResult<Option<T>> {
        read_frame(&mut self.stream).await
    }

    /// Shuts down the write half and drops the socket.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
