//! Multiplexed session abstraction.
//!
//! A [`Mux`] is one physical connection carrying many logical [`Stream`]s. The
//! client pool, the scavenger, the relay and the server only talk to this trait,
//! so the yamux-backed sessions and test doubles are interchangeable.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::tunmux::tunnel::{shaper::ShaperHandle, transport::BoxedStream};

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The peer sent a frame the multiplexer could not decode.
    #[error("mux: invalid protocol")]
    InvalidProtocol,
    #[error("mux: session closed")]
    Closed,
    #[error("mux: io: {0}")]
    Io(#[from] io::Error),
    #[error("mux: {0}")]
    Transport(String),
}

impl MuxError {
    pub fn is_protocol(&self) -> bool {
        match self {
            MuxError::InvalidProtocol => true,
            MuxError::Io(err) => err.kind() == io::ErrorKind::InvalidData,
            _ => false,
        }
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Io(err) => err,
            MuxError::InvalidProtocol => io::Error::new(io::ErrorKind::InvalidData, err),
            MuxError::Closed => io::Error::new(io::ErrorKind::ConnectionAborted, err),
            MuxError::Transport(_) => io::Error::other(err),
        }
    }
}

#[async_trait]
pub trait Mux: Send + Sync {
    /// Opens a new logical stream. Only meaningful on the dialing side.
    async fn open(&self) -> Result<Stream, MuxError>;

    /// Waits for the peer to open a stream. Fails once the session is closed.
    async fn accept(&self) -> Result<Stream, MuxError>;

    fn is_closed(&self) -> bool;

    fn num_streams(&self) -> usize;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Signals closure without waiting for in-flight streams. Idempotent.
    async fn close(&self);
}

/// Live-stream counter shared by a session and every [`Stream`] it hands out.
#[derive(Debug, Clone, Default)]
pub struct StreamCounter(Arc<AtomicUsize>);

impl StreamCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self) -> StreamGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        StreamGuard(self.0.clone())
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Decrements the owning session's stream count exactly once, on drop.
#[derive(Debug)]
pub struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One logical byte pipe inside a [`Mux`].
pub struct Stream {
    id: u32,
    remote: Option<SocketAddr>,
    inner: BoxedStream,
    shaper: Option<ShaperHandle>,
    _guard: StreamGuard,
}

impl Stream {
    pub fn new(id: u32, remote: Option<SocketAddr>, inner: BoxedStream, guard: StreamGuard) -> Self {
        Self {
            id,
            remote,
            inner,
            shaper: None,
            _guard: guard,
        }
    }

    /// Routes relay writes into this stream through the session's write shaper.
    pub fn with_shaper(mut self, shaper: ShaperHandle) -> Self {
        self.shaper = Some(shaper);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn shaper_handle(&self) -> Option<&ShaperHandle> {
        self.shaper.as_ref()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("shaped", &self.shaper.is_some())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
