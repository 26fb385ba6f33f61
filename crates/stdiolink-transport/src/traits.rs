//! Half-closable stream capability
//!
//! Defines the duplex-stream capability the bridge is written against:
//! a byte stream whose read and write sides close independently. Any
//! concrete transport (subprocess pipes, a raw socket, an in-memory
//! pipe) can implement it; the bridge never sees a concrete type.

use crate::error::{Result, TransportError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Readable side of a half-closable stream
///
/// `read` returning `Ok(0)` signals end-of-stream. `close_read` shuts
/// the read side down without disturbing the write side and is safe to
/// call more than once.
#[async_trait]
pub trait HalfCloseRead: Send {
    /// Read bytes into `buf`, returning the number read (0 = end-of-stream)
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Close the read side only
    async fn close_read(&mut self) -> Result<()>;
}

/// Writable side of a half-closable stream
///
/// `close_write` shuts the write side down (signalling end-of-stream
/// to the peer) without disturbing the read side, and is safe to call
/// more than once.
#[async_trait]
pub trait HalfCloseWrite: Send {
    /// Write bytes from `buf`, returning the number written
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Close the write side only
    async fn close_write(&mut self) -> Result<()>;

    /// Write the whole of `buf`
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = self.write(rest).await?;
            if n == 0 {
                return Err(TransportError::io(
                    "write",
                    std::io::Error::new(std::io::ErrorKind::WriteZero, "write returned 0 bytes"),
                ));
            }
            rest = &rest[n..];
        }
        Ok(())
    }
}

/// A duplex stream whose two directions close independently
///
/// The split is by value so each direction can be driven from its own
/// task; halves of the same stream share whatever state the concrete
/// transport needs (e.g. the subprocess kill condition).
pub trait HalfCloseStream: Send + std::fmt::Debug {
    /// Split into independently owned read and write halves
    fn into_split(self: Box<Self>) -> (Box<dyn HalfCloseRead>, Box<dyn HalfCloseWrite>);
}

/// A dialed connection, prior to being used as a stream
///
/// This is the point where a transport that cannot half-close is
/// rejected: converting succeeds only for transports that support
/// closing each direction on its own.
pub trait Connection: Send {
    /// Assert the half-close capability, consuming the connection
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Capability`] when the underlying
    /// transport has no independent half-closure.
    fn into_half_close(self: Box<Self>) -> Result<Box<dyn HalfCloseStream>>;
}

/// A function producing a connection when invoked
///
/// Deciding *which* transport to use happens when the dialer is built
/// (from the connection URL); actually connecting happens when it is
/// called. The [`CancelFlag`] aborts a dial before the helper process
/// starts; it has no effect once a connection exists.
pub type Dialer =
    Arc<dyn Fn(CancelFlag) -> BoxFuture<'static, Result<Box<dyn Connection>>> + Send + Sync>;

/// Cancellation signal for an in-flight dial
///
/// Cloning shares the flag. Once copying has started, callers cancel
/// by closing the streams, not through this flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a new, unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of any dial observing this flag
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Adapter exposing any reader/writer pair as a half-closable stream
///
/// Closing a side drops the corresponding half, which is how pipes and
/// process stdio close. Used to wrap the process's own stdin/stdout as
/// the local side of a bridge.
pub struct PipeStream<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> PipeStream<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Pair a reader and a writer into one duplex stream
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R, W> std::fmt::Debug for PipeStream<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeStream").finish_non_exhaustive()
    }
}

impl<R, W> HalfCloseStream for PipeStream<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn into_split(self: Box<Self>) -> (Box<dyn HalfCloseRead>, Box<dyn HalfCloseWrite>) {
        (
            Box::new(PipeReadHalf {
                inner: Some(self.reader),
            }),
            Box::new(PipeWriteHalf {
                inner: Some(self.writer),
            }),
        )
    }
}

impl<R, W> Connection for PipeStream<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn into_half_close(self: Box<Self>) -> Result<Box<dyn HalfCloseStream>> {
        Ok(self)
    }
}

struct PipeReadHalf<R> {
    inner: Option<R>,
}

#[async_trait]
impl<R> HalfCloseRead for PipeReadHalf<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.inner {
            Some(reader) => reader
                .read(buf)
                .await
                .map_err(|e| TransportError::io("read", e)),
            None => Ok(0),
        }
    }

    async fn close_read(&mut self) -> Result<()> {
        if self.inner.take().is_some() {
            debug!("pipe read side closed");
        }
        Ok(())
    }
}

struct PipeWriteHalf<W> {
    inner: Option<W>,
}

#[async_trait]
impl<W> HalfCloseWrite for PipeWriteHalf<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match &mut self.inner {
            Some(writer) => writer
                .write(buf)
                .await
                .map_err(|e| TransportError::io("write", e)),
            None => Err(TransportError::io(
                "write",
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write side already closed"),
            )),
        }
    }

    async fn close_write(&mut self) -> Result<()> {
        if let Some(mut writer) = self.inner.take() {
            writer
                .shutdown()
                .await
                .map_err(|e| TransportError::io("close-write", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_stream_round_trip() {
        let (client, mut server) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(client);
        let stream: Box<dyn HalfCloseStream> = Box::new(PipeStream::new(read, write));
        let (mut r, mut w) = stream.into_split();

        w.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        let n = r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_close_write_signals_eof_and_leaves_read_open() {
        let (client, mut server) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(client);
        let stream: Box<dyn HalfCloseStream> = Box::new(PipeStream::new(read, write));
        let (mut r, mut w) = stream.into_split();

        w.close_write().await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);

        // The read direction still works after the write side closed.
        server.write_all(b"late").await.unwrap();
        let n = r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
    }

    #[tokio::test]
    async fn test_close_operations_are_idempotent() {
        let (client, _server) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(client);
        let stream: Box<dyn HalfCloseStream> = Box::new(PipeStream::new(read, write));
        let (mut r, mut w) = stream.into_split();

        w.close_write().await.unwrap();
        w.close_write().await.unwrap();
        r.close_read().await.unwrap();
        r.close_read().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_after_close_read_is_eof() {
        let (client, _server) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(client);
        let stream: Box<dyn HalfCloseStream> = Box::new(PipeStream::new(read, write));
        let (mut r, _w) = stream.into_split();

        r.close_read().await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_after_close_write_fails() {
        let (client, _server) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(client);
        let stream: Box<dyn HalfCloseStream> = Box::new(PipeStream::new(read, write));
        let (_r, mut w) = stream.into_split();

        w.close_write().await.unwrap();
        let err = w.write(b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::Io { .. }));
    }

    #[test]
    fn test_cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
