use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU16, Ordering},
    },
};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::tunmux::net;
use crate::tunmux::telemetry::{self, ActiveRelayGuard, RelayInfo, SharedRelays};
use crate::tunmux::tunnel::{
    buffer::BufferPool,
    pool::SessionPool,
    relay::{self, RelayCounters, RelayOptions},
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub listen_addr: String,
    pub relay: RelayOptions,
    pub quiet: bool,
}

struct Shared {
    pool: Arc<SessionPool>,
    buffers: BufferPool,
    relays: SharedRelays,
    relay: RelayOptions,
    quiet: bool,
    next: AtomicU16,
}

/// Accepts local TCP connections and carries each one over a pooled session.
pub struct Client {
    listen_addr: String,
    shared: Arc<Shared>,
}

impl Client {
    pub fn new(
        opts: ClientOptions,
        pool: Arc<SessionPool>,
        buffers: BufferPool,
        relays: SharedRelays,
    ) -> Self {
        Self {
            listen_addr: opts.listen_addr,
            shared: Arc::new(Shared {
                pool,
                buffers,
                relays,
                relay: opts.relay,
                quiet: opts.quiet,
                next: AtomicU16::new(0),
            }),
        }
    }

    /// Binds the local listener, dials the pool in the background and serves
    /// until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(&self.listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("client: bind {}", self.listen_addr))?;

        tracing::info!(
            addr = %self.listen_addr,
            sessions = self.shared.pool.len(),
            "client: listening"
        );

        let pool = self.shared.pool.clone();
        tokio::spawn(async move { pool.fill().await });

        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (c, peer) = res.context("client: accept")?;
                    let _ = c.set_nodelay(true);
                    let index = self.shared.next.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(handle_conn(self.shared.clone(), c, peer, index));
                }
            }
        }
        Ok(())
    }
}

async fn handle_conn(shared: Arc<Shared>, c: TcpStream, peer: SocketAddr, index: u16) {
    let mux = shared.pool.acquire(index).await;
    let session = mux
        .remote_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let st = match mux.open().await {
        Ok(st) => st,
        Err(err) => {
            metrics::counter!("tunmux_stream_open_failures_total").increment(1);
            tracing::warn!(peer = %peer, session = %session, err = %err, "client: open stream failed");
            return;
        }
    };
    drop(mux);

    let stream_id = st.id();
    let counters = Arc::new(RelayCounters::default());
    let _guard = ActiveRelayGuard::register(
        shared.relays.clone(),
        RelayInfo {
            id: telemetry::new_relay_id(),
            side: "client",
            peer: peer.to_string(),
            session: session.clone(),
            stream_id,
            started_at_unix_ms: telemetry::now_unix_ms(),
        },
        counters.clone(),
    );

    if !shared.quiet {
        tracing::info!(peer = %peer, session = %session, stream = stream_id, "client: stream opened");
    }

    let report =
        relay::relay_with_counters(c, st, &shared.buffers, shared.relay.clone(), counters).await;

    metrics::counter!("tunmux_bytes_up_total").increment(report.a_to_b);
    metrics::counter!("tunmux_bytes_down_total").increment(report.b_to_a);

    match &report.error {
        Some(err) if report.is_protocol_error() => {
            tracing::warn!(peer = %peer, stream = stream_id, err = %err, "client: protocol error");
        }
        Some(err) => {
            tracing::debug!(peer = %peer, stream = stream_id, err = %err, "client: stream error");
        }
        None => {}
    }

    if !shared.quiet {
        tracing::info!(
            peer = %peer,
            stream = stream_id,
            up = report.a_to_b,
            down = report.b_to_a,
            "client: stream closed"
        );
    }
}
