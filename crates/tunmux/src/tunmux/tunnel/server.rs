use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::tunmux::net::{self, Target};
use crate::tunmux::telemetry::{self, ActiveRelayGuard, RelayInfo, SharedRelays};
use crate::tunmux::tunnel::{
    buffer::BufferPool,
    mux::{Mux, Stream},
    relay::{self, RelayCounters, RelayOptions},
    transport::{MuxOptions, TransportListener, kcp::KcpTuning, transport_by_name},
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub transport: String,
    /// `host:port` or a unix socket path.
    pub target_addr: String,
    pub dial_timeout: Duration,
    pub mux: MuxOptions,
    pub kcp: KcpTuning,
    pub relay: RelayOptions,
    pub quiet: bool,
}

struct Shared {
    target: Target,
    dial_timeout: Duration,
    relay: RelayOptions,
    quiet: bool,
    buffers: BufferPool,
    relays: SharedRelays,
}

/// Accepts multiplexed sessions and forwards every stream to one target.
pub struct Server {
    opts: ServerOptions,
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(opts: ServerOptions, buffers: BufferPool, relays: SharedRelays) -> Self {
        let shared = Arc::new(Shared {
            target: Target::parse(&opts.target_addr),
            dial_timeout: opts.dial_timeout,
            relay: opts.relay.clone(),
            quiet: opts.quiet,
            buffers,
            relays,
        });
        Self { opts, shared }
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let tr = transport_by_name(&self.opts.transport, &self.opts.kcp)?;
        let ln = tr
            .listen(&self.opts.listen_addr, self.opts.mux.clone())
            .await?;

        tracing::info!(
            addr = %self.opts.listen_addr,
            transport = %tr.name(),
            target = %self.shared.target,
            "server: listening"
        );

        self.serve(ln, shutdown).await
    }

    /// Runs the accept loop on an already bound listener. Returns on shutdown
    /// or on the first accept error.
    pub async fn serve(
        &self,
        ln: Box<dyn TransportListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                mux = ln.accept() => {
                    let mux = mux?;
                    metrics::counter!("tunmux_sessions_accepted_total").increment(1);
                    tracing::debug!(remote = ?mux.remote_addr(), "server: session accepted");
                    tokio::spawn(handle_mux(self.shared.clone(), mux, shutdown.clone()));
                }
            }
        }
        Ok(())
    }
}

async fn handle_mux(shared: Arc<Shared>, mux: Arc<dyn Mux>, mut shutdown: watch::Receiver<bool>) {
    let remote = mux
        .remote_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            st = mux.accept() => match st {
                Ok(st) => {
                    tokio::spawn(handle_stream(shared.clone(), remote.clone(), st));
                }
                Err(err) if err.is_protocol() => {
                    tracing::warn!(remote = %remote, err = %err, "server: session protocol error");
                    break;
                }
                Err(err) => {
                    tracing::debug!(remote = %remote, err = %err, "server: session ended");
                    break;
                }
            }
        }
    }

    mux.close().await;
}

async fn handle_stream(shared: Arc<Shared>, remote: String, st: Stream) {
    let stream_id = st.id();
    let target = match net::dial_target(&shared.target, shared.dial_timeout).await {
        Ok(c) => c,
        Err(err) => {
            metrics::counter!("tunmux_target_dial_failures_total").increment(1);
            tracing::warn!(remote = %remote, stream = stream_id, err = %err, "server: target dial failed");
            return;
        }
    };

    let counters = Arc::new(RelayCounters::default());
    let _guard = ActiveRelayGuard::register(
        shared.relays.clone(),
        RelayInfo {
            id: telemetry::new_relay_id(),
            side: "server",
            peer: remote.clone(),
            session: remote.clone(),
            stream_id,
            started_at_unix_ms: telemetry::now_unix_ms(),
        },
        counters.clone(),
    );

    if !shared.quiet {
        tracing::info!(remote = %remote, stream = stream_id, target = %shared.target, "server: stream opened");
    }

    let report = relay::relay_with_counters(
        st,
        target,
        &shared.buffers,
        shared.relay.clone(),
        counters,
    )
    .await;

    metrics::counter!("tunmux_bytes_up_total").increment(report.a_to_b);
    metrics::counter!("tunmux_bytes_down_total").increment(report.b_to_a);

    match &report.error {
        Some(err) if report.is_protocol_error() => {
            tracing::warn!(remote = %remote, stream = stream_id, err = %err, "server: protocol error");
        }
        Some(err) => {
            tracing::debug!(remote = %remote, stream = stream_id, err = %err, "server: stream error");
        }
        None => {}
    }

    if !shared.quiet {
        tracing::info!(
            remote = %remote,
            stream = stream_id,
            up = report.a_to_b,
            down = report.b_to_a,
            first = %report.first,
            "server: stream closed"
        );
    }
}
