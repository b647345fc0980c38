//! Background reclamation of sessions the pool has replaced.
//!
//! A retired session keeps serving the streams it already carries. The
//! scavenger closes it once those streams are gone, once it died on its own,
//! or once it has been retired for longer than the configured ceiling.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::tunmux::tunnel::mux::Mux;

#[derive(Debug, Clone)]
pub struct ScavengerOptions {
    /// Hard ceiling after which a retired session is closed even with live
    /// streams. `None` waits for the streams indefinitely.
    pub ttl: Option<Duration>,
    pub period: Duration,
}

impl Default for ScavengerOptions {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(600)),
            period: Duration::from_secs(1),
        }
    }
}

struct Marked {
    mux: Arc<dyn Mux>,
    marked_at: Instant,
}

fn same_session(a: &Arc<dyn Mux>, b: &Arc<dyn Mux>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub struct Scavenger {
    opts: ScavengerOptions,
    marked: Vec<Marked>,
}

impl Scavenger {
    pub fn new(opts: ScavengerOptions) -> Self {
        Self {
            opts,
            marked: Vec::new(),
        }
    }

    /// Starts tracking `mux`. Returns false if it is already tracked.
    pub fn mark(&mut self, mux: Arc<dyn Mux>, now: Instant) -> bool {
        if self.marked.iter().any(|m| same_session(&m.mux, &mux)) {
            return false;
        }
        self.marked.push(Marked {
            mux,
            marked_at: now,
        });
        metrics::gauge!("tunmux_scavenger_pending").set(self.marked.len() as f64);
        true
    }

    pub fn len(&self) -> usize {
        self.marked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    fn verdict(&self, m: &Marked, now: Instant) -> Option<&'static str> {
        if m.mux.is_closed() {
            return Some("closed");
        }
        if m.mux.num_streams() == 0 {
            return Some("drained");
        }
        match self.opts.ttl {
            Some(ttl) if now.saturating_duration_since(m.marked_at) >= ttl => Some("ttl"),
            _ => None,
        }
    }

    /// Closes every tracked session that is due and stops tracking it.
    /// Returns how many were closed.
    pub async fn sweep(&mut self, now: Instant) -> usize {
        let mut kept = Vec::with_capacity(self.marked.len());
        let mut closed = 0;
        for m in std::mem::take(&mut self.marked) {
            match self.verdict(&m, now) {
                Some(reason) => {
                    tracing::debug!(
                        remote = ?m.mux.remote_addr(),
                        streams = m.mux.num_streams(),
                        reason,
                        "scavenger: closing session"
                    );
                    m.mux.close().await;
                    metrics::counter!("tunmux_sessions_scavenged_total", "reason" => reason)
                        .increment(1);
                    closed += 1;
                }
                None => kept.push(m),
            }
        }
        self.marked = kept;
        metrics::gauge!("tunmux_scavenger_pending").set(self.marked.len() as f64);
        closed
    }

    /// Closes everything still tracked.
    pub async fn close_all(&mut self) -> usize {
        let n = self.marked.len();
        for m in self.marked.drain(..) {
            m.mux.close().await;
            metrics::counter!("tunmux_sessions_scavenged_total", "reason" => "shutdown")
                .increment(1);
        }
        metrics::gauge!("tunmux_scavenger_pending").set(0.0);
        n
    }

    /// Runs a scavenger task until `shutdown` flips to true.
    pub fn spawn(
        opts: ScavengerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> (ScavengerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Scavenger::new(opts).run(rx, shutdown));
        (ScavengerHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Arc<dyn Mux>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(self.opts.period.max(Duration::from_millis(10)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(mux) = rx.recv() => {
                    self.mark(mux, Instant::now());
                }
                _ = tick.tick() => {
                    self.sweep(Instant::now()).await;
                }
            }
        }

        while let Ok(mux) = rx.try_recv() {
            self.mark(mux, Instant::now());
        }
        let n = self.close_all().await;
        tracing::debug!(closed = n, "scavenger: stopped");
    }
}

/// Hands retired sessions to the scavenger task. Cheap to clone.
#[derive(Clone)]
pub struct ScavengerHandle {
    tx: mpsc::UnboundedSender<Arc<dyn Mux>>,
}

impl ScavengerHandle {
    /// Queues `mux` for reclamation. If the scavenger has already stopped the
    /// session is closed right away.
    pub fn retire(&self, mux: Arc<dyn Mux>) {
        if let Err(mpsc::error::SendError(mux)) = self.tx.send(mux) {
            tokio::spawn(async move { mux.close().await });
        }
    }

    /// A handle whose retired sessions land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Arc<dyn Mux>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl std::fmt::Debug for ScavengerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScavengerHandle")
            .field("running", &!self.tx.is_closed())
            .finish()
    }
}
