use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::tunmux::tunnel::mux::Mux;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Smallest per-stream receive window yamux accepts.
pub const MIN_STREAM_WINDOW: u32 = 256 * 1024;

/// Parameters forwarded to the multiplexer of every session.
#[derive(Debug, Clone)]
pub struct MuxOptions {
    /// Ping interval; `None` disables keepalive.
    pub keepalive: Option<Duration>,
    pub max_stream_window: u32,
    /// Streams the peer may open before the local accept loop picks them up.
    pub accept_backlog: usize,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(10)),
            max_stream_window: MIN_STREAM_WINDOW,
            accept_backlog: 64,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(&self, addr: &str, opts: MuxOptions)
    -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str, opts: MuxOptions) -> anyhow::Result<Arc<dyn Mux>>;
}

/// Accepts physical connections, each already wrapped as a server-side [`Mux`].
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Arc<dyn Mux>>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "kcp" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|kcp)"),
    }
}

pub mod kcp;
pub mod tcp;
pub mod yamux;

pub fn transport_by_name(name: &str, kcp: &kcp::KcpTuning) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        "kcp" => Ok(Arc::new(kcp::KcpTransport::new(kcp)?)),
        _ => unreachable!(),
    }
}

pub(crate) async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("tunnel: could not resolve {addr:?}"))
}
