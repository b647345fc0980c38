use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, mpsc},
};

use crate::tunmux::tunnel::{
    mux::{Mux, MuxError, Stream, StreamCounter},
    shaper::ShaperHandle,
    transport::{MIN_STREAM_WINDOW, MuxOptions},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// A yamux session over any physical byte stream (TCP, KCP, ...).
///
/// A driver task polls the yamux session; incoming streams are queued for
/// [`Mux::accept`] on the server side and refused on the client side.
pub struct YamuxMux {
    control: Mutex<tokio_yamux::Control>,
    incoming: Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    remote: Option<SocketAddr>,
    streams: StreamCounter,
    closed: Arc<AtomicBool>,
    close_requested: AtomicBool,
    protocol_error: Arc<AtomicBool>,
    shaper: ShaperHandle,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxMux {
    pub fn server<T>(io: T, remote: Option<SocketAddr>, opts: &MuxOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = tokio_yamux::Session::new_server(io, yamux_config(opts));
        Self::from_session(session, Role::Server, remote, opts)
    }

    pub fn client<T>(io: T, remote: Option<SocketAddr>, opts: &MuxOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = tokio_yamux::Session::new_client(io, yamux_config(opts));
        Self::from_session(session, Role::Client, remote, opts)
    }

    fn from_session<T>(
        mut session: tokio_yamux::Session<T>,
        role: Role,
        remote: Option<SocketAddr>,
        opts: &MuxOptions,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let control = session.control();
        let closed = Arc::new(AtomicBool::new(false));
        let protocol_error = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(opts.accept_backlog.max(1));
        let task = tokio::spawn({
            let closed = closed.clone();
            let protocol_error = protocol_error.clone();
            async move {
                while let Some(next) = session.next().await {
                    match next {
                        Ok(st) if role == Role::Server => {
                            if tx.send(st).await.is_err() {
                                break;
                            }
                        }
                        Ok(st) => {
                            tracing::debug!(remote = ?remote, stream = st.id(), "mux: refusing peer-opened stream");
                        }
                        Err(err) => {
                            if err.kind() == io::ErrorKind::InvalidData {
                                protocol_error.store(true, Ordering::Release);
                                tracing::warn!(remote = ?remote, err = %err, "mux: invalid protocol from peer");
                            } else {
                                tracing::debug!(remote = ?remote, err = %err, "mux: session ended");
                            }
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::Release);
            }
        });

        Self {
            control: Mutex::new(control),
            incoming: Mutex::new(rx),
            remote,
            streams: StreamCounter::new(),
            closed,
            close_requested: AtomicBool::new(false),
            protocol_error,
            shaper: ShaperHandle::spawn(),
            task,
        }
    }

    fn wrap(&self, st: tokio_yamux::StreamHandle) -> Stream {
        let id = st.id();
        Stream::new(id, self.remote, Box::new(st), self.streams.track())
            .with_shaper(self.shaper.clone())
    }

    fn closed_error(&self) -> MuxError {
        if self.protocol_error.load(Ordering::Acquire) {
            MuxError::InvalidProtocol
        } else {
            MuxError::Closed
        }
    }
}

fn yamux_config(opts: &MuxOptions) -> tokio_yamux::Config {
    let defaults = tokio_yamux::Config::default();
    tokio_yamux::Config {
        enable_keepalive: opts.keepalive.is_some(),
        keepalive_interval: opts.keepalive.unwrap_or(defaults.keepalive_interval),
        max_stream_window_size: opts.max_stream_window.max(MIN_STREAM_WINDOW),
        ..defaults
    }
}

#[async_trait]
impl Mux for YamuxMux {
    async fn open(&self) -> Result<Stream, MuxError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut ctrl = self.control.lock().await;
        match ctrl.open_stream().await {
            Ok(st) => Ok(self.wrap(st)),
            Err(_) if self.is_closed() => Err(self.closed_error()),
            Err(err) => Err(MuxError::Transport(err.to_string())),
        }
    }

    async fn accept(&self) -> Result<Stream, MuxError> {
        let mut rx = self.incoming.lock().await;
        match rx.recv().await {
            Some(st) => Ok(self.wrap(st)),
            None => Err(self.closed_error()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.close_requested.load(Ordering::Acquire)
    }

    fn num_streams(&self) -> usize {
        self.streams.get()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    async fn close(&self) {
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task.abort();
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }
}

impl Drop for YamuxMux {
    fn drop(&mut self) {
        self.task.abort();
    }
}
