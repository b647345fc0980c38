//! Client-side pool of multiplexed sessions.
//!
//! The pool holds a fixed number of slots. Each acquisition picks a slot by
//! index, and replaces the session in it if it is missing, closed or past its
//! expiry. Replaced sessions go to the scavenger so the streams they still
//! carry can finish.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{sync::Mutex, time::Instant};

use crate::tunmux::telemetry;
use crate::tunmux::tunnel::{
    mux::Mux,
    scavenger::ScavengerHandle,
    transport::{MuxOptions, Transport},
};

/// Produces new client sessions to the remote end.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> anyhow::Result<Arc<dyn Mux>>;
}

pub struct TransportDialer {
    transport: Arc<dyn Transport>,
    addr: String,
    opts: MuxOptions,
    timeout: Duration,
}

impl TransportDialer {
    pub fn new(
        transport: Arc<dyn Transport>,
        addr: impl Into<String>,
        opts: MuxOptions,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            addr: addr.into(),
            opts,
            timeout,
        }
    }
}

#[async_trait]
impl Dialer for TransportDialer {
    async fn dial(&self) -> anyhow::Result<Arc<dyn Mux>> {
        let fut = self.transport.dial(&self.addr, self.opts.clone());
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => anyhow::bail!(
                "{} dial {}: timed out after {:?}",
                self.transport.name(),
                self.addr,
                self.timeout
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub size: usize,
    /// Sessions older than this are replaced on their next acquisition.
    pub auto_expire: Option<Duration>,
    pub retry_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 1,
            auto_expire: None,
            retry_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct Slot {
    mux: Option<Arc<dyn Mux>>,
    expires_at: Option<Instant>,
    dialed_at_unix_ms: u64,
    generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub index: usize,
    /// True while the slot is locked, typically because it is dialing.
    pub busy: bool,
    pub connected: bool,
    pub remote: Option<String>,
    pub streams: usize,
    pub generation: u64,
    pub dialed_at_unix_ms: u64,
    pub expires_in_ms: Option<u64>,
}

pub struct SessionPool {
    dialer: Arc<dyn Dialer>,
    opts: PoolOptions,
    slots: Vec<Mutex<Slot>>,
    scavenger: ScavengerHandle,
}

impl SessionPool {
    pub fn new(dialer: Arc<dyn Dialer>, opts: PoolOptions, scavenger: ScavengerHandle) -> Self {
        let size = opts.size.max(1);
        let slots = (0..size).map(|_| Mutex::new(Slot::default())).collect();
        Self {
            dialer,
            opts: PoolOptions { size, ..opts },
            slots,
            scavenger,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns a live session for slot `index % len`, dialing a replacement
    /// first when needed. Dial failures are retried until one succeeds.
    pub async fn acquire(&self, index: u16) -> Arc<dyn Mux> {
        let i = index as usize % self.slots.len();
        let mut slot = self.slots[i].lock().await;

        let reason = match &slot.mux {
            None => "empty",
            Some(mux) if mux.is_closed() => "closed",
            Some(_) if slot.expires_at.is_some_and(|t| Instant::now() > t) => "expired",
            Some(mux) => return mux.clone(),
        };

        if let Some(old) = slot.mux.take() {
            tracing::debug!(slot = i, reason, remote = ?old.remote_addr(), "pool: replacing session");
            metrics::counter!("tunmux_pool_replacements_total", "reason" => reason).increment(1);
            self.scavenger.retire(old);
        }

        let mux = self.dial_until_ready(i).await;
        slot.mux = Some(mux.clone());
        slot.expires_at = self.opts.auto_expire.map(|d| Instant::now() + d);
        slot.dialed_at_unix_ms = telemetry::now_unix_ms();
        slot.generation += 1;
        mux
    }

    /// Dials every slot. Used at start-up so the first connections do not pay
    /// for the handshake.
    pub async fn fill(&self) {
        for i in 0..self.slots.len() {
            self.acquire(i as u16).await;
        }
    }

    async fn dial_until_ready(&self, slot: usize) -> Arc<dyn Mux> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.dialer.dial().await {
                Ok(mux) => {
                    metrics::counter!("tunmux_pool_dials_total", "result" => "ok").increment(1);
                    tracing::info!(slot, attempt, remote = ?mux.remote_addr(), "pool: session established");
                    return mux;
                }
                Err(err) => {
                    metrics::counter!("tunmux_pool_dials_total", "result" => "error").increment(1);
                    tracing::warn!(
                        slot,
                        attempt,
                        err = %err,
                        retry_in = %humantime::format_duration(self.opts.retry_interval),
                        "pool: dial failed"
                    );
                    tokio::time::sleep(self.opts.retry_interval).await;
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let now = Instant::now();
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| match slot.try_lock() {
                Ok(slot) => {
                    let mux = slot.mux.as_ref();
                    SlotSnapshot {
                        index,
                        busy: false,
                        connected: mux.is_some_and(|m| !m.is_closed()),
                        remote: mux.and_then(|m| m.remote_addr()).map(|a| a.to_string()),
                        streams: mux.map_or(0, |m| m.num_streams()),
                        generation: slot.generation,
                        dialed_at_unix_ms: slot.dialed_at_unix_ms,
                        expires_in_ms: slot
                            .expires_at
                            .map(|t| t.saturating_duration_since(now).as_millis() as u64),
                    }
                }
                Err(_) => SlotSnapshot {
                    index,
                    busy: true,
                    connected: false,
                    remote: None,
                    streams: 0,
                    generation: 0,
                    dialed_at_unix_ms: 0,
                    expires_in_ms: None,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use crate::tunmux::tunnel::mux::mock::MockMux;

    #[derive(Default)]
    struct MockDialer {
        attempts: AtomicUsize,
        fail_first: AtomicUsize,
        next_id: AtomicU16,
        dialed: std::sync::Mutex<Vec<Arc<MockMux>>>,
    }

    impl MockDialer {
        fn failing(n: usize) -> Self {
            let d = Self::default();
            d.fail_first.store(n, Ordering::SeqCst);
            d
        }

        fn dialed(&self, i: usize) -> Arc<MockMux> {
            self.dialed.lock().unwrap()[i].clone()
        }
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(&self) -> anyhow::Result<Arc<dyn Mux>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("connection refused");
            }
            let mux = Arc::new(MockMux::new(self.next_id.fetch_add(1, Ordering::SeqCst)));
            self.dialed.lock().unwrap().push(mux.clone());
            Ok(mux as Arc<dyn Mux>)
        }
    }

    fn port(mux: &Arc<dyn Mux>) -> u16 {
        mux.remote_addr().unwrap().port()
    }

    fn pool(
        dialer: Arc<MockDialer>,
        opts: PoolOptions,
    ) -> (SessionPool, mpsc::UnboundedReceiver<Arc<dyn Mux>>) {
        let (scavenger, retired) = ScavengerHandle::channel();
        (SessionPool::new(dialer, opts, scavenger), retired)
    }

    #[tokio::test]
    async fn round_robin_visits_each_slot_in_turn() {
        let dialer = Arc::new(MockDialer::default());
        let (pool, _retired) = pool(
            dialer.clone(),
            PoolOptions {
                size: 3,
                ..PoolOptions::default()
            },
        );

        let mut seen = Vec::new();
        for i in 0..9u16 {
            seen.push(port(&pool.acquire(i).await));
        }
        assert_eq!(
            seen,
            vec![10_000, 10_001, 10_002, 10_000, 10_001, 10_002, 10_000, 10_001, 10_002]
        );
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn index_wraps_modulo_pool_size() {
        let dialer = Arc::new(MockDialer::default());
        let (pool, _retired) = pool(
            dialer,
            PoolOptions {
                size: 3,
                ..PoolOptions::default()
            },
        );
        let a = pool.acquire(u16::MAX).await;
        let b = pool.acquire(0).await;
        // 65535 % 3 == 0
        assert_eq!(port(&a), port(&b));
    }

    #[tokio::test]
    async fn zero_size_is_clamped_to_one() {
        let (pool, _retired) = pool(
            Arc::new(MockDialer::default()),
            PoolOptions {
                size: 0,
                ..PoolOptions::default()
            },
        );
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_sessions_are_replaced_and_retired() {
        let dialer = Arc::new(MockDialer::default());
        let (pool, mut retired) = pool(
            dialer.clone(),
            PoolOptions {
                size: 1,
                auto_expire: Some(Duration::from_secs(1)),
                ..PoolOptions::default()
            },
        );

        let first = pool.acquire(0).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(port(&pool.acquire(0).await), port(&first));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let second = pool.acquire(0).await;
        assert_ne!(port(&second), port(&first));

        let old = retired.try_recv().unwrap();
        assert_eq!(port(&old), port(&first));
        assert_eq!(pool.snapshot()[0].generation, 2);
    }

    #[tokio::test]
    async fn closed_sessions_are_replaced() {
        let dialer = Arc::new(MockDialer::default());
        let (pool, mut retired) = pool(dialer.clone(), PoolOptions::default());

        let first = pool.acquire(0).await;
        dialer.dialed(0).kill();
        let second = pool.acquire(0).await;
        assert_ne!(port(&second), port(&first));
        assert!(!second.is_closed());
        assert_eq!(port(&retired.try_recv().unwrap()), port(&first));
    }

    #[tokio::test(start_paused = true)]
    async fn dial_failures_are_retried_at_the_interval() {
        let dialer = Arc::new(MockDialer::failing(2));
        let (pool, _retired) = pool(
            dialer.clone(),
            PoolOptions {
                retry_interval: Duration::from_millis(100),
                ..PoolOptions::default()
            },
        );

        let start = Instant::now();
        let mux = pool.acquire(0).await;
        assert!(!mux.is_closed());
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn fill_dials_every_slot_and_snapshot_reports_them() {
        let dialer = Arc::new(MockDialer::default());
        let (pool, _retired) = pool(
            dialer.clone(),
            PoolOptions {
                size: 2,
                ..PoolOptions::default()
            },
        );
        pool.fill().await;
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 2);

        let _stream = pool.acquire(1).await.open().await.unwrap();
        let snap = pool.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.iter().all(|s| s.connected && !s.busy));
        assert_eq!(snap[0].streams, 0);
        assert_eq!(snap[1].streams, 1);
        assert_eq!(snap[1].remote.as_deref(), Some("127.0.0.1:10001"));
        assert_eq!(snap[1].expires_in_ms, None);
    }
}
