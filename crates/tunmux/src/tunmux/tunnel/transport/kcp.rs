use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};

use crate::tunmux::net;
use crate::tunmux::tunnel::{
    mux::Mux,
    transport::{MuxOptions, Transport, TransportListener, resolve_socket_addr, yamux::YamuxMux},
};

/// KCP knobs exposed in the config file.
#[derive(Debug, Clone)]
pub struct KcpTuning {
    /// normal | fast | fast2 | fast3
    pub mode: String,
    pub mtu: usize,
    pub sndwnd: u16,
    pub rcvwnd: u16,
}

impl Default for KcpTuning {
    fn default() -> Self {
        Self {
            mode: "fast".into(),
            mtu: 1350,
            sndwnd: 1024,
            rcvwnd: 1024,
        }
    }
}

impl KcpTuning {
    /// (nodelay, interval ms, fast resend, no congestion control) per mode.
    fn nodelay(&self) -> anyhow::Result<KcpNoDelayConfig> {
        let (nodelay, interval, resend, nc) = match self.mode.trim().to_ascii_lowercase().as_str() {
            "normal" => (false, 40, 2, true),
            "" | "fast" => (false, 30, 2, true),
            "fast2" => (true, 20, 2, true),
            "fast3" => (true, 10, 2, true),
            other => anyhow::bail!("kcp: unknown mode {other:?} (expected normal|fast|fast2|fast3)"),
        };
        Ok(KcpNoDelayConfig {
            nodelay,
            interval,
            resend,
            nc,
        })
    }

    pub fn to_config(&self) -> anyhow::Result<KcpConfig> {
        Ok(KcpConfig {
            mtu: self.mtu,
            nodelay: self.nodelay()?,
            wnd_size: (self.sndwnd, self.rcvwnd),
            stream: true,
            ..KcpConfig::default()
        })
    }
}

/// Reliable UDP (KCP) + yamux multiplexing.
pub struct KcpTransport {
    kcp: KcpConfig,
}

impl KcpTransport {
    pub fn new(tuning: &KcpTuning) -> anyhow::Result<Self> {
        Ok(Self {
            kcp: tuning.to_config()?,
        })
    }
}

#[async_trait]
impl Transport for KcpTransport {
    fn name(&self) -> &'static str {
        "kcp"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: MuxOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr: SocketAddr = net::normalize_bind_addr(addr)
            .parse()
            .with_context(|| format!("kcp: invalid listen address {addr:?}"))?;
        let ln = KcpListener::bind(self.kcp.clone(), bind_addr)
            .await
            .with_context(|| format!("bind kcp {addr}"))?;
        let local = ln.local_addr().ok();
        Ok(Box::new(KcpTransportListener {
            ln: Mutex::new(ln),
            local,
            opts,
        }))
    }

    async fn dial(&self, addr: &str, opts: MuxOptions) -> anyhow::Result<Arc<dyn Mux>> {
        let remote = resolve_socket_addr(addr).await?;
        let c = KcpStream::connect(&self.kcp, remote)
            .await
            .with_context(|| format!("dial kcp {addr}"))?;
        Ok(Arc::new(YamuxMux::client(c, Some(remote), &opts)))
    }
}

pub struct KcpTransportListener {
    ln: Mutex<KcpListener>,
    local: Option<SocketAddr>,
    opts: MuxOptions,
}

#[async_trait]
impl TransportListener for KcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn Mux>> {
        let mut ln = self.ln.lock().await;
        let (c, peer) = ln.accept().await?;
        Ok(Arc::new(YamuxMux::server(c, Some(peer), &self.opts)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_map_to_nodelay_presets() {
        let mut t = KcpTuning::default();
        let fast = t.nodelay().unwrap();
        assert!(!fast.nodelay);
        assert_eq!(fast.interval, 30);

        t.mode = "FAST3".into();
        let fast3 = t.nodelay().unwrap();
        assert!(fast3.nodelay);
        assert_eq!(fast3.interval, 10);

        t.mode = "turbo".into();
        assert!(t.to_config().is_err());
    }

    #[test]
    fn tuning_sets_window_and_mtu() {
        let t = KcpTuning {
            mode: "normal".into(),
            mtu: 1200,
            sndwnd: 128,
            rcvwnd: 512,
        };
        let cfg = t.to_config().unwrap();
        assert_eq!(cfg.mtu, 1200);
        assert_eq!(cfg.wnd_size, (128, 512));
        assert!(cfg.stream);
    }
}
