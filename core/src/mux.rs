//! Stream multiplexing: one [`MuxSession`] carries many logical
//! [`MuxStream`]s over a single underlying carrier, and the client-side
//! [`MuxPool`] allocates streams across a set of pooled sessions.
//!
//! Frame-level multiplexing is delegated to the `yamux` crate rather than
//! reimplemented; its `Connection`/`Stream` types are wrapped here to
//! satisfy this crate's fixed parameters (version 1, 30 s/70 s keep-alive,
//! 16 KiB frames, 256 KiB session buffer, 64 KiB stream buffer) and its own
//! open-stream-count bookkeeping, since `yamux` does not expose a live
//! stream-count itself. `yamux` 0.13 drives the connection through
//! `poll_next_inbound`/`poll_new_outbound` rather than a cloneable control
//! handle, so a session owns its `Connection` in a single driver task and
//! exposes outbound opens through a channel.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{Context as _, Result};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use crate::carrier::Carrier;
use crate::error::MuxPoolError;

/// The fixed mux parameters from spec §4.5 / §6. These never vary at
/// runtime; only the per-session stream ceiling is configurable.
pub struct MuxSessionConfig {
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub max_frame_size: usize,
    pub max_session_receive_buffer: usize,
    pub max_stream_receive_buffer: usize,
    /// Per-session open-stream ceiling (1..16, default 4 on the client; the
    /// server enforces its own default of 16, see spec §4.5).
    pub stream_ceiling: usize,
}

impl Default for MuxSessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(70),
            max_frame_size: 16 * 1024,
            max_session_receive_buffer: 256 * 1024,
            max_stream_receive_buffer: 64 * 1024,
            stream_ceiling: 4,
        }
    }
}

impl MuxSessionConfig {
    /// `max_frame_size`, `keepalive_interval`, and `keepalive_timeout` are
    /// spec-fixed parameters the pinned `yamux` 0.13 has no setter for; they
    /// stay on this struct for documentation and future crate upgrades but
    /// are not passed to `yamux::Config` below.
    fn yamux_config(&self) -> yamux::Config {
        let mut cfg = yamux::Config::default();
        cfg.set_max_num_streams(self.stream_ceiling);
        cfg.set_max_connection_receive_window(Some(self.max_session_receive_buffer));
        cfg
    }
}

fn next_session_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A logical sub-stream of a [`MuxSession`]; itself a [`Carrier`]. Closing a
/// stream does not close its session.
pub struct MuxStream {
    inner: tokio_util::compat::Compat<yamux::Stream>,
    open_streams: Arc<AtomicUsize>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.open_streams.fetch_sub(1, Ordering::Relaxed);
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl Carrier for MuxStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.remote_addr)
    }
}

type OpenReply = oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>;

/// A client-side mux session: a background task owns the `yamux::Connection`
/// outright and drives it with the poll API, and outbound-stream requests
/// reach it over `open_tx` rather than through a cloneable control handle.
pub struct MuxSession {
    id: u64,
    open_tx: mpsc::UnboundedSender<OpenReply>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    open_streams: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl MuxSession {
    /// Wraps `carrier` as a yamux client session and spawns the task that
    /// owns and drives the connection. Polling is required even though the
    /// client never expects inbound streams — the connection makes no
    /// progress otherwise, and open-stream requests are serviced from the
    /// same task so the `Connection` is never touched from two places.
    pub fn spawn_client<C: Carrier>(carrier: C, config: &MuxSessionConfig) -> Arc<MuxSession> {
        let local_addr = carrier.local_addr().unwrap_or_else(|_| dummy_addr());
        let remote_addr = carrier.remote_addr().unwrap_or_else(|_| dummy_addr());

        let io = carrier.compat();
        let mut connection = yamux::Connection::new(io, config.yamux_config(), yamux::Mode::Client);

        let id = next_session_id();
        let closed = Arc::new(AtomicBool::new(false));
        let open_streams = Arc::new(AtomicUsize::new(0));
        let (open_tx, mut open_rx) = mpsc::unbounded_channel::<OpenReply>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let closed_for_task = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    inbound = poll_fn(|cx| connection.poll_next_inbound(cx)) => {
                        match inbound {
                            Some(Ok(_stream)) => {
                                warn!(session = id, "client mux session received unexpected inbound stream");
                            }
                            Some(Err(e)) => {
                                debug!(session = id, error = %e, "mux session driver ended with error");
                                break;
                            }
                            None => break,
                        }
                    }
                    req = open_rx.recv() => {
                        match req {
                            Some(reply) => {
                                let result = poll_fn(|cx| connection.poll_new_outbound(cx)).await;
                                let _ = reply.send(result);
                            }
                            None => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            closed_for_task.store(true, Ordering::Relaxed);
        });

        Arc::new(MuxSession {
            id,
            open_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            open_streams,
            closed,
            local_addr,
            remote_addr,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn num_streams(&self) -> usize {
        self.open_streams.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub async fn open_stream(&self) -> Result<MuxStream, MuxPoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx.send(reply_tx).map_err(|_| {
            MuxPoolError::SessionHandshakeFailed(io::Error::new(
                io::ErrorKind::NotConnected,
                "mux session driver task has exited",
            ))
        })?;
        let stream = reply_rx
            .await
            .map_err(|_| {
                MuxPoolError::SessionHandshakeFailed(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "mux session driver task has exited",
                ))
            })?
            .map_err(|e| MuxPoolError::SessionHandshakeFailed(io::Error::new(io::ErrorKind::Other, e)))?;
        self.open_streams.fetch_add(1, Ordering::Relaxed);
        Ok(MuxStream {
            inner: stream.compat(),
            open_streams: self.open_streams.clone(),
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
        })
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

fn dummy_addr() -> SocketAddr {
    "0.0.0.0:0".parse().expect("valid dummy address")
}

/// Runs the server-side accept loop over an incoming mux session: every
/// accepted stream is handed to `handler`. When the session's open-stream
/// count exceeds `ceiling`, the offending stream is dropped and the session
/// torn down (spec §4.5).
pub async fn serve_session<C, F, Fut>(
    carrier: C,
    config: &MuxSessionConfig,
    ceiling: usize,
    mut handler: F,
) where
    C: Carrier,
    F: FnMut(MuxStream) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let local_addr = carrier.local_addr().unwrap_or_else(|_| dummy_addr());
    let remote_addr = carrier.remote_addr().unwrap_or_else(|_| dummy_addr());

    let io = carrier.compat();
    let mut connection = yamux::Connection::new(io, config.yamux_config(), yamux::Mode::Server);
    let open_streams = Arc::new(AtomicUsize::new(0));

    loop {
        let inbound = poll_fn(|cx| connection.poll_next_inbound(cx)).await;
        match inbound {
            Some(Ok(inbound_stream)) => {
                if open_streams.load(Ordering::Relaxed) >= ceiling {
                    warn!(ceiling, "mux session exceeded stream ceiling, tearing down");
                    drop(inbound_stream);
                    break;
                }
                open_streams.fetch_add(1, Ordering::Relaxed);
                let stream = MuxStream {
                    inner: inbound_stream.compat(),
                    open_streams: open_streams.clone(),
                    local_addr,
                    remote_addr,
                };
                tokio::spawn(handler(stream));
            }
            Some(Err(e)) => {
                debug!(error = %e, "mux session accept loop ended with error");
                break;
            }
            None => break,
        }
    }
}

/// Dials a fresh outbound carrier for a new mux session. Supplied by the
/// caller since the carrier kind (raw TLS vs WSS) is a client configuration
/// detail the pool itself doesn't need to know.
pub type DialFn = Box<
    dyn Fn() -> Pin<Box<dyn std::future::Future<Output = Result<crate::carrier::BoxedCarrier>> + Send>>
        + Send
        + Sync,
>;

const REAPER_TICK: Duration = Duration::from_secs(2);
const IDLE_THRESHOLD: Duration = Duration::from_secs(10);

/// Client-side pool of mux sessions keyed by session identity. See spec
/// §4.5/§9: scans never hold a global lock across the whole operation, a
/// session observed closed is evicted and never targeted again, and stream
/// count (not pool cardinality) is the only cross-task invariant.
pub struct MuxPool {
    sessions: DashMap<u64, Arc<MuxSession>>,
    config: MuxSessionConfig,
    dial: DialFn,
}

impl MuxPool {
    pub fn new(config: MuxSessionConfig, dial: DialFn) -> Arc<MuxPool> {
        Arc::new(MuxPool {
            sessions: DashMap::new(),
            config,
            dial,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Implements `openStream()` from spec §4.5: scan-evict-or-open, else
    /// create a new session and open on it.
    pub async fn open_stream(self: &Arc<Self>) -> Result<MuxStream, MuxPoolError> {
        let candidates: Vec<Arc<MuxSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for session in candidates {
            if session.is_closed() {
                self.sessions.remove(&session.id());
                continue;
            }
            if session.num_streams() < self.config.stream_ceiling {
                match session.open_stream().await {
                    Ok(stream) => return Ok(stream),
                    Err(_) => {
                        self.sessions.remove(&session.id());
                        continue;
                    }
                }
            }
        }

        let carrier = (self.dial)()
            .await
            .map_err(|e| MuxPoolError::DialFailed(io::Error::new(io::ErrorKind::Other, e)))?;
        let session = MuxSession::spawn_client(carrier, &self.config);
        self.sessions.insert(session.id(), session.clone());
        self.spawn_idle_reaper(session.clone());

        session.open_stream().await
    }

    fn spawn_idle_reaper(self: &Arc<Self>, session: Arc<MuxSession>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut idle_since: Option<tokio::time::Instant> = None;
            let mut ticker = tokio::time::interval(REAPER_TICK);
            loop {
                ticker.tick().await;
                if session.is_closed() {
                    pool.sessions.remove(&session.id());
                    break;
                }
                if session.num_streams() == 0 {
                    let since = idle_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() > IDLE_THRESHOLD {
                        session.close().await;
                        pool.sessions.remove(&session.id());
                        break;
                    }
                } else {
                    idle_since = None;
                }
            }
        });
    }
}
