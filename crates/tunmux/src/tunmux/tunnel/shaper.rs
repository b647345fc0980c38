//! Priority write shaping for streams that share one session.
//!
//! Every session owns one scheduler task that hands out write turns. A stream
//! asks for a turn before each write attempt; pending requests sit in a
//! min-heap keyed by `(priority, seq)` and are granted one at a time, smallest
//! key first. A stream's priority is the number of bytes it has already pushed
//! through the shaper, so a stream that has sent little overtakes a bulk
//! transfer queued on the same session.
//!
//! A turn covers a single non-blocking `poll_write`. A stream whose flow-control
//! window is exhausted gives its turn back and waits for the window on its own
//! task, so it never holds up the other streams of the session.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    future::poll_fn,
    io,
    pin::Pin,
    task::Poll,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};

/// A queued job. Lower `priority` is served first; `seq` keeps FIFO order
/// among equal priorities.
#[derive(Debug)]
pub struct WriteRequest<T> {
    pub priority: u64,
    pub seq: u64,
    pub item: T,
}

impl<T> PartialEq for WriteRequest<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for WriteRequest<T> {}

impl<T> PartialOrd for WriteRequest<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for WriteRequest<T> {
    // Reversed: BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
pub struct Shaper<T> {
    heap: BinaryHeap<WriteRequest<T>>,
    next_seq: u64,
}

impl<T> Shaper<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, priority: u64, item: T) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(WriteRequest {
            priority,
            seq,
            item,
        });
    }

    /// Removes the most urgent request, or `None` when there is no work.
    pub fn pop(&mut self) -> Option<WriteRequest<T>> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for Shaper<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Permission to attempt one write. The scheduler grants the next turn once
/// this is dropped.
pub struct Turn {
    _release: oneshot::Sender<()>,
}

type Grant = oneshot::Sender<Turn>;

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "shaper: scheduler stopped")
}

/// Submission side of a session's scheduler. Cheap to clone.
#[derive(Clone)]
pub struct ShaperHandle {
    tx: mpsc::UnboundedSender<(u64, Grant)>,
}

impl ShaperHandle {
    /// Starts a scheduler task; it exits once every handle is dropped.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(rx));
        Self { tx }
    }

    /// Queues a turn request without waiting for it.
    pub fn request(&self, priority: u64) -> io::Result<oneshot::Receiver<Turn>> {
        let (grant, rx) = oneshot::channel();
        self.tx.send((priority, grant)).map_err(|_| stopped())?;
        Ok(rx)
    }

    /// Waits until the scheduler grants a turn at `priority`.
    pub async fn turn(&self, priority: u64) -> io::Result<Turn> {
        self.request(priority)?.await.map_err(|_| stopped())
    }

    /// Writes all of `buf` into `w`, one granted turn per write attempt, then
    /// flushes. `written` is the stream's priority and grows with every byte
    /// accepted by `w`.
    pub async fn write_all<W>(
        &self,
        w: &mut W,
        mut buf: &[u8],
        written: &mut u64,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        while !buf.is_empty() {
            let turn = self.turn(*written).await?;
            let step = poll_fn(|cx| Poll::Ready(Pin::new(&mut *w).poll_write(cx, buf))).await;
            drop(turn);

            match step {
                Poll::Ready(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Poll::Ready(Ok(n)) => {
                    buf = &buf[n..];
                    *written += n as u64;
                }
                Poll::Ready(Err(err)) => return Err(err),
                Poll::Pending => parked().await,
            }
        }
        w.flush().await
    }
}

impl std::fmt::Debug for ShaperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaperHandle").finish_non_exhaustive()
    }
}

/// Suspends until the task is woken by the waker the last `Pending` write
/// registered.
async fn parked() {
    let mut woken = false;
    poll_fn(|_| {
        if woken {
            Poll::Ready(())
        } else {
            woken = true;
            Poll::Pending
        }
    })
    .await
}

async fn drain(mut rx: mpsc::UnboundedReceiver<(u64, Grant)>) {
    let mut shaper = Shaper::new();
    loop {
        while let Ok((priority, grant)) = rx.try_recv() {
            shaper.push(priority, grant);
        }

        let Some(req) = shaper.pop() else {
            match rx.recv().await {
                Some((priority, grant)) => {
                    shaper.push(priority, grant);
                    continue;
                }
                None => break,
            }
        };

        let (release, released) = oneshot::channel();
        // The requester gave up if the grant cannot be delivered.
        if req.item.send(Turn { _release: release }).is_ok() {
            let _ = released.await;
        }
    }
}
