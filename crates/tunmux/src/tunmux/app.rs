use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::tunmux::{
    admin, config, logging, net, telemetry,
    tunnel::{
        self,
        buffer::BufferPool,
        pool::{PoolOptions, SessionPool, TransportDialer},
        relay::RelayOptions,
        scavenger::{Scavenger, ScavengerOptions},
        transport::{MuxOptions, kcp::KcpTuning, transport_by_name},
    },
};

fn mux_options(cfg: &config::Config) -> MuxOptions {
    MuxOptions {
        keepalive: cfg.mux.keepalive,
        max_stream_window: cfg.mux.max_stream_window,
        ..MuxOptions::default()
    }
}

fn kcp_tuning(cfg: &config::Config) -> KcpTuning {
    KcpTuning {
        mode: cfg.kcp.mode.clone(),
        mtu: cfg.kcp.mtu,
        sndwnd: cfg.kcp.sndwnd,
        rcvwnd: cfg.kcp.rcvwnd,
    }
}

fn relay_options(cfg: &config::Config) -> RelayOptions {
    RelayOptions {
        close_wait: cfg.relay.close_wait,
    }
}

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        client = cfg.client.is_some(),
        server = cfg.server.is_some(),
        admin_addr = %cfg.admin_addr,
        buffer_size = cfg.relay.buffer_size,
        "tunmux: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let relays = Arc::new(telemetry::RelayRegistry::new());
    let buffers = BufferPool::new(cfg.relay.buffer_size, cfg.relay.pool_capacity);
    let kcp = kcp_tuning(&cfg);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // Tunnel server.
    if let Some(sc) = &cfg.server {
        let server = tunnel::server::Server::new(
            tunnel::server::ServerOptions {
                listen_addr: sc.listen_addr.clone(),
                transport: sc.transport.clone(),
                target_addr: sc.target_addr.clone(),
                dial_timeout: sc.dial_timeout,
                mux: mux_options(&cfg),
                kcp: kcp.clone(),
                relay: relay_options(&cfg),
                quiet: cfg.relay.quiet,
            },
            buffers.clone(),
            relays.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    // Tunnel client.
    let mut pool = None;
    if let Some(cc) = &cfg.client {
        let (scavenger, scavenger_task) = Scavenger::spawn(
            ScavengerOptions {
                ttl: cc.scavenge_ttl,
                ..ScavengerOptions::default()
            },
            shutdown_rx.clone(),
        );
        tasks.spawn(async move {
            scavenger_task.await.context("scavenger task")?;
            Ok(())
        });

        let dialer = TransportDialer::new(
            transport_by_name(&cc.transport, &kcp)?,
            cc.remote_addr.clone(),
            mux_options(&cfg),
            cc.dial_timeout,
        );
        let session_pool = Arc::new(SessionPool::new(
            Arc::new(dialer),
            PoolOptions {
                size: cc.conn,
                auto_expire: cc.auto_expire,
                retry_interval: cc.retry_interval,
            },
            scavenger,
        ));
        pool = Some(session_pool.clone());

        let client = tunnel::client::Client::new(
            tunnel::client::ClientOptions {
                listen_addr: cc.listen_addr.clone(),
                relay: relay_options(&cfg),
                quiet: cfg.relay.quiet,
            },
            session_pool,
            buffers.clone(),
            relays.clone(),
        );
        tracing::info!(
            remote = %cc.remote_addr,
            transport = %cc.transport,
            conn = cc.conn,
            auto_expire = ?cc.auto_expire,
            scavenge_ttl = ?cc.scavenge_ttl,
            "client: configured"
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    // Admin server.
    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            relays: relays.clone(),
            pool,
            buffers: buffers.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for a shutdown signal or the first task to stop.
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
        }
    };
    let _ = shutdown_tx.send(true);

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::debug!(err = %err, "shutdown: task ended with error");
            }
        }
    };

    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out, aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> config::Config {
        config::Config {
            admin_addr: String::new(),
            logging: config::LoggingConfig::default(),
            client: None,
            server: None,
            mux: config::MuxConfig {
                keepalive: None,
                max_stream_window: 512 * 1024,
            },
            relay: config::RelayConfig {
                buffer_size: 4096,
                pool_capacity: 8,
                close_wait: Duration::from_secs(2),
                quiet: true,
            },
            kcp: config::KcpConfig {
                mode: "fast2".into(),
                mtu: 1400,
                sndwnd: 256,
                rcvwnd: 512,
            },
        }
    }

    #[test]
    fn config_sections_map_onto_tunnel_options() {
        let cfg = sample();

        let mux = mux_options(&cfg);
        assert_eq!(mux.keepalive, None);
        assert_eq!(mux.max_stream_window, 512 * 1024);

        let kcp = kcp_tuning(&cfg);
        assert_eq!(kcp.mode, "fast2");
        assert_eq!((kcp.sndwnd, kcp.rcvwnd), (256, 512));
        assert!(kcp.to_config().is_ok());

        assert_eq!(relay_options(&cfg).close_wait, Duration::from_secs(2));
    }
}
