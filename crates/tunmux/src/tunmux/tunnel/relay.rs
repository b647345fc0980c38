//! Bidirectional byte relay between two endpoints.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    net::TcpStream,
};

use crate::tunmux::tunnel::{
    buffer::{BufferPool, PooledBuf},
    mux::{MuxError, Stream},
    shaper::ShaperHandle,
    transport::BoxedStream,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// One side of a relay. Endpoints backed by a mux stream may expose their
/// session's write shaper; writes into them are then scheduled by priority.
pub trait Endpoint: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn shaper(&self) -> Option<ShaperHandle> {
        None
    }
}

impl Endpoint for TcpStream {}
impl Endpoint for DuplexStream {}
impl Endpoint for BoxedStream {}
#[cfg(unix)]
impl Endpoint for tokio::net::UnixStream {}

impl Endpoint for Stream {
    fn shaper(&self) -> Option<ShaperHandle> {
        self.shaper_handle().cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// How long the surviving direction may keep copying after the other one
    /// reached EOF. Zero ends the relay as soon as either side finishes.
    pub close_wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AToB,
    BToA,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::AToB => f.write_str("a->b"),
            Direction::BToA => f.write_str("b->a"),
        }
    }
}

/// Live byte counters; shared with the admin registry while a relay runs.
#[derive(Debug, Default)]
pub struct RelayCounters {
    pub a_to_b: AtomicU64,
    pub b_to_a: AtomicU64,
}

impl RelayCounters {
    fn get(&self, dir: Direction) -> &AtomicU64 {
        match dir {
            Direction::AToB => &self.a_to_b,
            Direction::BToA => &self.b_to_a,
        }
    }
}

#[derive(Debug)]
pub struct RelayReport {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub first: Direction,
    pub error: Option<io::Error>,
}

impl RelayReport {
    pub fn is_protocol_error(&self) -> bool {
        self.error.as_ref().is_some_and(is_protocol_error)
    }
}

/// True for malformed multiplexer frames, as opposed to ordinary I/O failures.
pub fn is_protocol_error(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::InvalidData {
        return true;
    }
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<MuxError>())
        .is_some_and(MuxError::is_protocol)
}

/// Write half of an endpoint. Writes go through the session's shaper when the
/// endpoint has one.
struct HalfWriter {
    w: Box<dyn AsyncWrite + Send + Unpin>,
    shaper: Option<ShaperHandle>,
    written: u64,
}

impl HalfWriter {
    fn new<W>(w: W, shaper: Option<ShaperHandle>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            w: Box::new(w),
            shaper,
            written: 0,
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let Self { w, shaper, written } = self;
        match shaper {
            Some(shaper) => shaper.write_all(w, buf, written).await,
            None => {
                w.write_all(buf).await?;
                w.flush().await
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, self.w.shutdown()).await;
    }
}

async fn copy_half<R>(
    mut src: R,
    dst: &mut HalfWriter,
    mut buf: PooledBuf,
    count: &AtomicU64,
    half_close: bool,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            if half_close {
                dst.shutdown().await;
            }
            return Ok(());
        }
        dst.write(&buf[..n]).await?;
        count.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Copies `a → b` and `b → a` until either direction ends.
pub async fn relay<A, B>(a: A, b: B, pool: &BufferPool, opts: RelayOptions) -> RelayReport
where
    A: Endpoint,
    B: Endpoint,
{
    relay_with_counters(a, b, pool, opts, Arc::new(RelayCounters::default())).await
}

/// [`relay`] that publishes progress into caller-owned counters.
pub async fn relay_with_counters<A, B>(
    a: A,
    b: B,
    pool: &BufferPool,
    opts: RelayOptions,
    counters: Arc<RelayCounters>,
) -> RelayReport
where
    A: Endpoint,
    B: Endpoint,
{
    let a_shaper = a.shaper();
    let b_shaper = b.shaper();
    let (a_rd, a_wr) = tokio::io::split(a);
    let (b_rd, b_wr) = tokio::io::split(b);
    let mut a_wr = HalfWriter::new(a_wr, a_shaper);
    let mut b_wr = HalfWriter::new(b_wr, b_shaper);
    let half_close = !opts.close_wait.is_zero();

    let (first, error) = {
        let ab = copy_half(
            a_rd,
            &mut b_wr,
            pool.acquire(),
            counters.get(Direction::AToB),
            half_close,
        );
        let ba = copy_half(
            b_rd,
            &mut a_wr,
            pool.acquire(),
            counters.get(Direction::BToA),
            half_close,
        );
        tokio::pin!(ab);
        tokio::pin!(ba);

        let (first, res) = tokio::select! {
            res = &mut ab => (Direction::AToB, res),
            res = &mut ba => (Direction::BToA, res),
        };

        let mut error = res.err();
        if error.is_none() && half_close {
            let rest = match first {
                Direction::AToB => tokio::time::timeout(opts.close_wait, &mut ba).await,
                Direction::BToA => tokio::time::timeout(opts.close_wait, &mut ab).await,
            };
            if let Ok(Err(err)) = rest {
                error = Some(err);
            }
        }
        (first, error)
    };

    a_wr.shutdown().await;
    b_wr.shutdown().await;

    RelayReport {
        a_to_b: counters.a_to_b.load(Ordering::Relaxed),
        b_to_a: counters.b_to_a.load(Ordering::Relaxed),
        first,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tunmux::tunnel::{
        mux::{Mux, StreamCounter},
        transport::{MuxOptions, yamux::YamuxMux},
    };

    #[tokio::test]
    async fn relays_both_directions_in_order() {
        let pool = BufferPool::new(1024, 4);
        let (a, mut a_peer) = tokio::io::duplex(4096);
        let (b, mut b_peer) = tokio::io::duplex(4096);

        let relay_pool = pool.clone();
        let task =
            tokio::spawn(async move { relay(a, b, &relay_pool, RelayOptions::default()).await });

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            a_peer.write_all(&payload).await.unwrap();
            let mut reply = [0u8; 4];
            a_peer.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"done");
            a_peer
        });

        let mut got = vec![0u8; expected.len()];
        b_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        b_peer.write_all(b"done").await.unwrap();

        let a_peer = writer.await.unwrap();
        drop(a_peer);

        let report = task.await.unwrap();
        assert_eq!(report.a_to_b, 64 * 1024);
        assert_eq!(report.b_to_a, 4);
        assert_eq!(report.first, Direction::AToB);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn relays_large_payloads_both_ways_at_once() {
        const UP: usize = 256 * 1024;
        const DOWN: usize = 192 * 1024;

        let pool = BufferPool::new(4096, 4);
        let (a, a_peer) = tokio::io::duplex(8192);
        let (b, b_peer) = tokio::io::duplex(8192);

        let relay_pool = pool.clone();
        let task =
            tokio::spawn(async move { relay(a, b, &relay_pool, RelayOptions::default()).await });

        let up: Vec<u8> = (0..UP).map(|i| (i % 251) as u8).collect();
        let down: Vec<u8> = (0..DOWN).map(|i| (i % 241) as u8).collect();

        let side = |peer: DuplexStream, send: Vec<u8>, expect: usize| {
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(peer);
                let send_task = tokio::spawn(async move {
                    w.write_all(&send).await.unwrap();
                    w
                });
                let mut got = vec![0u8; expect];
                r.read_exact(&mut got).await.unwrap();
                let w = send_task.await.unwrap();
                (r.unsplit(w), got)
            })
        };
        let a_side = side(a_peer, up.clone(), DOWN);
        let b_side = side(b_peer, down.clone(), UP);

        let (a_peer, from_b) = a_side.await.unwrap();
        let (b_peer, from_a) = b_side.await.unwrap();
        assert_eq!(from_a, up);
        assert_eq!(from_b, down);

        drop(a_peer);
        drop(b_peer);
        let report = task.await.unwrap();
        assert_eq!(report.a_to_b, UP as u64);
        assert_eq!(report.b_to_a, DOWN as u64);
    }

    #[tokio::test]
    async fn closing_either_endpoint_ends_the_relay() {
        let pool = BufferPool::new(64, 4);
        let (a, a_peer) = tokio::io::duplex(64);
        let (b, mut b_peer) = tokio::io::duplex(64);

        let relay_pool = pool.clone();
        let task =
            tokio::spawn(async move { relay(a, b, &relay_pool, RelayOptions::default()).await });

        drop(a_peer);
        let report = task.await.unwrap();
        assert_eq!(report.first, Direction::AToB);

        // The far side of `b` observes EOF once the relay has dropped it.
        let mut rest = Vec::new();
        b_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn one_buffer_per_direction_is_released() {
        let pool = BufferPool::new(64, 4);
        let (a, mut a_peer) = tokio::io::duplex(64);
        let (b, b_peer) = tokio::io::duplex(64);

        let relay_pool = pool.clone();
        let task =
            tokio::spawn(async move { relay(a, b, &relay_pool, RelayOptions::default()).await });

        a_peer.write_all(b"x").await.unwrap();
        drop(b_peer);
        task.await.unwrap();
        drop(a_peer);

        let st = pool.stats();
        assert_eq!(st.acquired, 2);
        assert_eq!(st.released, 2);
        assert_eq!(st.idle, 2);
    }

    #[tokio::test]
    async fn close_wait_lets_the_other_direction_finish() {
        let pool = BufferPool::new(64, 4);
        let (a, mut a_peer) = tokio::io::duplex(64);
        let (b, mut b_peer) = tokio::io::duplex(64);

        let relay_pool = pool.clone();
        let opts = RelayOptions {
            close_wait: Duration::from_secs(5),
        };
        let task = tokio::spawn(async move { relay(a, b, &relay_pool, opts).await });

        // a half-closes; b still answers afterwards.
        a_peer.write_all(b"req").await.unwrap();
        a_peer.shutdown().await.unwrap();

        let mut req = Vec::new();
        b_peer.read_to_end(&mut req).await.unwrap();
        assert_eq!(req, b"req");
        b_peer.write_all(b"resp").await.unwrap();
        drop(b_peer);

        let mut resp = Vec::new();
        a_peer.read_to_end(&mut resp).await.unwrap();
        assert_eq!(resp, b"resp");

        let report = task.await.unwrap();
        assert_eq!(report.first, Direction::AToB);
        assert_eq!(report.b_to_a, 4);
    }

    #[tokio::test]
    async fn shaped_stream_endpoint_relays_through_the_session() {
        let pool = BufferPool::new(256, 4);
        let (c, s) = tokio::io::duplex(256 * 1024);
        let opts = MuxOptions::default();
        let client = YamuxMux::client(c, None, &opts);
        let server = YamuxMux::server(s, None, &opts);

        let stream = client.open().await.unwrap();
        assert!(stream.shaper().is_some());
        let (local, mut local_peer) = tokio::io::duplex(1024);

        let relay_pool = pool.clone();
        let task = tokio::spawn(async move {
            relay(local, stream, &relay_pool, RelayOptions::default()).await
        });

        local_peer.write_all(b"through the mux").await.unwrap();
        let mut inc = server.accept().await.unwrap();
        let mut got = [0u8; 15];
        inc.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"through the mux");

        inc.write_all(b"back").await.unwrap();
        inc.flush().await.unwrap();
        let mut back = [0u8; 4];
        local_peer.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"back");

        drop(local_peer);
        let report = task.await.unwrap();
        assert_eq!(report.a_to_b, 15);
        assert_eq!(report.b_to_a, 4);
    }

    #[tokio::test]
    async fn slow_reader_does_not_hold_up_other_streams_of_its_session() {
        let pool = BufferPool::new(16 * 1024, 8);
        let (c, s) = tokio::io::duplex(1024 * 1024);
        let opts = MuxOptions::default();
        let client = YamuxMux::client(c, None, &opts);
        let server = YamuxMux::server(s, None, &opts);

        // Bulk stream whose far end drains 1 KiB every 20 ms.
        let bulk = client.open().await.unwrap();
        let (bulk_local, mut bulk_peer) = tokio::io::duplex(64 * 1024);
        let bulk_counters = Arc::new(RelayCounters::default());
        let bulk_relay = tokio::spawn({
            let pool = pool.clone();
            let counters = bulk_counters.clone();
            async move {
                relay_with_counters(bulk_local, bulk, &pool, RelayOptions::default(), counters)
                    .await
            }
        });
        let feeder = tokio::spawn(async move {
            let _ = bulk_peer.write_all(&vec![7u8; 2 * 1024 * 1024]).await;
            bulk_peer
        });
        let mut slow = server.accept().await.unwrap();
        let slow_reader = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while matches!(slow.read(&mut buf).await, Ok(n) if n > 0) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        // Wait until the bulk stream has used up most of its send window.
        tokio::time::timeout(Duration::from_secs(5), async {
            while bulk_counters.a_to_b.load(Ordering::Relaxed) < 128 * 1024 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let chat = client.open().await.unwrap();
        let (chat_local, mut chat_peer) = tokio::io::duplex(1024);
        let chat_relay = tokio::spawn({
            let pool = pool.clone();
            async move { relay(chat_local, chat, &pool, RelayOptions::default()).await }
        });
        chat_peer.write_all(b"hi").await.unwrap();

        let mut inc = server.accept().await.unwrap();
        let mut got = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(1), inc.read_exact(&mut got))
            .await
            .expect("interactive stream stalled behind the bulk stream")
            .unwrap();
        assert_eq!(&got, b"hi");

        drop(chat_peer);
        chat_relay.await.unwrap();
        slow_reader.abort();
        feeder.abort();
        bulk_relay.abort();
    }

    #[test]
    fn protocol_errors_are_classified() {
        assert!(is_protocol_error(&io::Error::from(io::ErrorKind::InvalidData)));
        assert!(is_protocol_error(&io::Error::other(MuxError::InvalidProtocol)));
        assert!(!is_protocol_error(&io::Error::other(MuxError::Closed)));
        assert!(!is_protocol_error(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
    }

    #[tokio::test]
    async fn plain_stream_has_no_shaper() {
        let (near, _far) = tokio::io::duplex(8);
        let st = Stream::new(1, None, Box::new(near), StreamCounter::new().track());
        assert!(Endpoint::shaper(&st).is_none());
    }
}
