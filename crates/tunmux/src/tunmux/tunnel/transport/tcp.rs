use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::tunmux::net;
use crate::tunmux::tunnel::{
    mux::Mux,
    transport::{MuxOptions, Transport, TransportListener, yamux::YamuxMux},
};

/// Plain TCP + yamux multiplexing.
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: MuxOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind tcp {addr}"))?;
        Ok(Box::new(TcpTransportListener { ln, opts }))
    }

    async fn dial(&self, addr: &str, opts: MuxOptions) -> anyhow::Result<Arc<dyn Mux>> {
        let c = TcpStream::connect(addr)
            .await
            .with_context(|| format!("dial tcp {addr}"))?;
        let _ = c.set_nodelay(true);
        let remote = c.peer_addr().ok();
        Ok(Arc::new(YamuxMux::client(c, remote, &opts)))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
    opts: MuxOptions,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn Mux>> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok(Arc::new(YamuxMux::server(c, Some(peer), &self.opts)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}
