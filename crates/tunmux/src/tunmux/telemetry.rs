use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::tunmux::tunnel::relay::RelayCounters;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// Static description of one running relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelayInfo {
    pub id: String,
    /// "client" or "server".
    pub side: &'static str,
    pub peer: String,
    pub session: String,
    pub stream_id: u32,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    #[serde(flatten)]
    pub info: RelayInfo,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[derive(Debug)]
struct Entry {
    info: RelayInfo,
    counters: Arc<RelayCounters>,
}

#[derive(Debug, Default)]
pub struct RelayRegistry {
    relays: DashMap<String, Entry>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, info: RelayInfo, counters: Arc<RelayCounters>) {
        self.relays
            .insert(info.id.clone(), Entry { info, counters });
    }

    pub fn remove(&self, id: &str) {
        self.relays.remove(id);
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn snapshot(&self) -> Vec<RelaySnapshot> {
        let mut out = Vec::with_capacity(self.relays.len());
        for r in self.relays.iter() {
            let e = r.value();
            out.push(RelaySnapshot {
                info: e.info.clone(),
                bytes_up: e.counters.a_to_b.load(Ordering::Relaxed),
                bytes_down: e.counters.b_to_a.load(Ordering::Relaxed),
            });
        }
        out.sort_by(|a, b| a.info.started_at_unix_ms.cmp(&b.info.started_at_unix_ms));
        out
    }
}

pub type SharedRelays = Arc<RelayRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_relay_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("r{n}")
}

/// Registers a relay and keeps the active-relay gauge up while alive.
pub struct ActiveRelayGuard {
    id: String,
    side: &'static str,
    registry: SharedRelays,
}

impl ActiveRelayGuard {
    pub fn register(registry: SharedRelays, info: RelayInfo, counters: Arc<RelayCounters>) -> Self {
        let id = info.id.clone();
        let side = info.side;
        metrics::counter!("tunmux_relays_total", "side" => side).increment(1);
        metrics::gauge!("tunmux_active_relays", "side" => side).increment(1.0);
        registry.add(info, counters);
        Self { id, side, registry }
    }
}

impl Drop for ActiveRelayGuard {
    fn drop(&mut self) {
        metrics::gauge!("tunmux_active_relays", "side" => self.side).decrement(1.0);
        self.registry.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, started: u64) -> RelayInfo {
        RelayInfo {
            id: id.into(),
            side: "server",
            peer: "10.0.0.1:5000".into(),
            session: "10.0.0.1:5000".into(),
            stream_id: 1,
            started_at_unix_ms: started,
        }
    }

    #[test]
    fn guard_registers_and_unregisters() {
        let reg: SharedRelays = Arc::new(RelayRegistry::new());
        let counters = Arc::new(RelayCounters::default());
        let guard = ActiveRelayGuard::register(reg.clone(), info("r-a", 1), counters.clone());
        counters.a_to_b.fetch_add(7, Ordering::Relaxed);

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].bytes_up, 7);
        assert_eq!(snap[0].bytes_down, 0);

        drop(guard);
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_is_ordered_by_start_time() {
        let reg = RelayRegistry::new();
        reg.add(info("late", 20), Arc::default());
        reg.add(info("early", 10), Arc::default());
        let ids: Vec<_> = reg.snapshot().into_iter().map(|s| s.info.id).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn relay_ids_are_unique() {
        assert_ne!(new_relay_id(), new_relay_id());
    }
}
