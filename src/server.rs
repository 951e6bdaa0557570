//! Listener and server side of virtual connections
//!
//! One HTTP server with a single `POST /` handler carries every virtual
//! connection. Request bodies are frame chains routed by connection
//! identifier; response bodies carry whatever outbound bytes the matching
//! connection has buffered. The server never initiates traffic: bytes
//! written by the server application wait in the connection's write buffer
//! until a direct POST or an orchestrator ping arrives to carry them.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, TunnelError};
use crate::frame::{
    parse_chain, write_frame, write_terminator, Frame, FrameCipher, OPT_CLOSED, OPT_HELLO,
    OPT_PING, OPT_SYNC_CONN_IDX, OPT_SYNC_CTR,
};
use crate::read_conn::ReadConn;

/// Backlog of accepted-but-not-yet-claimed connections.
const PENDING_CONNS: usize = 1024;

/// Poll interval while a writer waits for buffer space.
const WRITE_RETRY: Duration = Duration::from_secs(1);

/// Cadence of the verbose stats task.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

struct ServerWrite {
    /// Sequence number of the last payload frame drained into a response.
    counter: u32,
    buf: Vec<u8>,
    /// Set on close; the next drain delivers an `OPT_CLOSED` frame instead
    /// of data once the buffer runs dry.
    closed: bool,
}

pub(crate) struct ServerInner {
    idx: u64,
    read: Arc<ReadConn>,
    write: Mutex<ServerWrite>,
    last_active: Mutex<Instant>,
    config: Config,
}

/// Server end of a virtual connection, handed out by [`Listener::accept`].
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct ServerConn {
    inner: Arc<ServerInner>,
}

impl ServerConn {
    fn new(idx: u64, cipher: FrameCipher, config: Config) -> Self {
        let read = ReadConn::new(idx, cipher, 's', config.max_write_buffer_size);
        Self {
            inner: Arc::new(ServerInner {
                idx,
                read,
                write: Mutex::new(ServerWrite {
                    counter: 0,
                    buf: Vec::new(),
                    closed: false,
                }),
                last_active: Mutex::new(Instant::now()),
                config,
            }),
        }
    }

    pub fn conn_idx(&self) -> u64 {
        self.inner.idx
    }

    pub async fn read(&self, p: &mut [u8]) -> Result<usize> {
        self.inner.read.read(p).await
    }

    /// Buffer bytes for the peer. The flush is passive: they leave in the
    /// response body of whichever request reaches this connection next.
    pub async fn write(&self, p: &[u8]) -> Result<usize> {
        loop {
            if let Some(e) = self.inner.read.err() {
                return Err(e);
            }
            if self.inner.read.is_closed() {
                return Err(TunnelError::ClosedConn);
            }
            {
                let w = self.inner.write.lock();
                if w.closed {
                    return Err(TunnelError::ClosedConn);
                }
                if w.buf.len() <= self.inner.config.max_write_buffer_size {
                    break;
                }
            }
            debug!(conn = %self, "write buffer is full");
            tokio::time::sleep(WRITE_RETRY).await;
        }

        let mut w = self.inner.write.lock();
        if w.closed {
            return Err(TunnelError::ClosedConn);
        }
        w.buf.extend_from_slice(p);
        Ok(p.len())
    }

    /// Close this side. The peer learns of it from an `OPT_CLOSED` frame in
    /// its next poll; the listener forgets the connection once that frame
    /// has been handed over (or the GC gets there first).
    pub fn close(&self) {
        debug!(conn = %self, "closing");
        self.inner.write.lock().closed = true;
        self.inner.read.close();
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.read.set_deadline(deadline);
    }

    /// Accepted for interface parity but has no effect: writes only block on
    /// buffer backpressure, which polls on its own.
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) {}

    fn close_by_peer(&self) {
        self.inner.write.lock().closed = true;
        self.inner.read.close();
    }

    fn touch_active(&self) {
        *self.inner.last_active.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.inner.last_active.lock().elapsed()
    }

    async fn feed(&self, f: Frame) -> Result<()> {
        self.inner.read.feed_frame(f).await
    }

    /// Drain up to `cap` buffered bytes into `out` as one
    /// `{sync} {payload}` batch. Returns true when the connection is closed
    /// and its farewell frame has just been emitted, i.e. the listener
    /// should forget it.
    fn drain_into(&self, out: &mut BytesMut, cipher: &FrameCipher, cap: usize) -> bool {
        let mut w = self.inner.write.lock();
        if w.buf.is_empty() {
            if w.closed {
                write_frame(out, &Frame::control(self.inner.idx, OPT_SYNC_CONN_IDX), cipher);
                write_frame(out, &Frame::control(self.inner.idx, OPT_CLOSED), cipher);
                return true;
            }
            return false;
        }
        let take = w.buf.len().min(cap);
        let data: Vec<u8> = w.buf.drain(..take).collect();
        w.counter = w.counter.wrapping_add(1);
        write_frame(out, &Frame::control(self.inner.idx, OPT_SYNC_CONN_IDX), cipher);
        write_frame(out, &Frame::payload(w.counter, self.inner.idx, data.into()), cipher);
        false
    }

    fn pending_bytes(&self) -> usize {
        self.inner.write.lock().buf.len()
    }
}

impl fmt::Display for ServerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<ServerConn:{:x},r:{},w:{}>",
            self.inner.idx,
            self.inner.read.counter(),
            self.inner.write.lock().counter
        )
    }
}

pub(crate) struct ListenerShared {
    conns: DashMap<u64, ServerConn>,
    pending_tx: mpsc::Sender<ServerConn>,
    cipher: FrameCipher,
    config: Config,
}

impl ListenerShared {
    /// Resolve one of the 4-byte identifiers carried by a ping frame; they
    /// are the low 32 bits of the full connection identifier.
    fn find_by_short_id(&self, short: u32) -> Option<ServerConn> {
        self.conns
            .iter()
            .find(|e| *e.key() as u32 == short)
            .map(|e| e.value().clone())
    }
}

/// Accepts virtual connections tunneled through one HTTP endpoint.
pub struct Listener {
    shared: Arc<ListenerShared>,
    local_addr: SocketAddr,
    pending_rx: tokio::sync::Mutex<mpsc::Receiver<ServerConn>>,
    err_rx: tokio::sync::Mutex<mpsc::Receiver<TunnelError>>,
    err_tx: mpsc::Sender<TunnelError>,
    closed: AtomicBool,
    tasks: Vec<JoinHandle<()>>,
}

impl Listener {
    pub(crate) async fn bind(network: &str, address: &str, config: Config) -> Result<Listener> {
        let tcp = tokio::net::TcpListener::bind(address).await?;
        let local_addr = tcp.local_addr()?;
        let cipher = FrameCipher::new(network);

        let (pending_tx, pending_rx) = mpsc::channel(PENDING_CONNS);
        let (err_tx, err_rx) = mpsc::channel(1);

        let shared = Arc::new(ListenerShared {
            conns: DashMap::new(),
            pending_tx,
            cipher,
            config: config.clone(),
        });

        // Request bodies are bounded by the peer's write buffer, plus frame
        // overhead; anything bigger is not ours.
        let body_limit = config.max_write_buffer_size * 2 + 4096;
        let app = Router::new()
            .route("/", post(handler))
            .layer(DefaultBodyLimit::max(body_limit))
            .with_state(shared.clone());

        let mut tasks = Vec::new();
        let serve_err = err_tx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(tcp, app).await {
                let _ = serve_err.try_send(TunnelError::Io(e.to_string()));
            }
        }));
        tasks.push(tokio::spawn(gc_loop(shared.clone())));
        if config.verbose {
            tasks.push(tokio::spawn(stats_loop(shared.clone())));
        }

        info!(%local_addr, "listening");
        Ok(Listener {
            shared,
            local_addr,
            pending_rx: tokio::sync::Mutex::new(pending_rx),
            err_rx: tokio::sync::Mutex::new(err_rx),
            err_tx,
            closed: AtomicBool::new(false),
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next pending virtual connection, or the sticky serve error.
    pub async fn accept(&self) -> Result<ServerConn> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TunnelError::ListenerClosed);
        }
        let mut pending = self.pending_rx.lock().await;
        let mut errs = self.err_rx.lock().await;
        tokio::select! {
            conn = pending.recv() => conn.ok_or(TunnelError::ListenerClosed),
            err = errs.recv() => Err(err.unwrap_or(TunnelError::ListenerClosed)),
        }
    }

    /// Stop serving. Pending and future `accept` calls return an error;
    /// established connections are not torn down explicitly and age out via
    /// the peer's retry envelope.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.err_tx.try_send(TunnelError::ListenerClosed);
        for task in &self.tasks {
            task.abort();
        }
        info!(local_addr = %self.local_addr, "listener closed");
    }

    /// Number of live virtual connections, for diagnostics.
    pub fn active_conns(&self) -> usize {
        self.shared.conns.len()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// The single HTTP entry point: parse, route, feed, drain, respond.
async fn handler(
    State(l): State<Arc<ListenerShared>>,
    body: Bytes,
) -> (StatusCode, Bytes) {
    let mut src = body;
    let frames = match parse_chain(&mut src, &l.cipher) {
        Some(frames) => frames,
        None => return (StatusCode::SERVICE_UNAVAILABLE, Bytes::new()),
    };
    let Some(first) = frames.first() else {
        return (StatusCode::SERVICE_UNAVAILABLE, Bytes::new());
    };

    if first.options & OPT_PING != 0 {
        return (StatusCode::OK, pong(&l, &first.data));
    }

    if first.options & OPT_SYNC_CONN_IDX == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, Bytes::new());
    }
    let conn_idx = first.conn_idx;

    let known = l.conns.get(&conn_idx).map(|e| e.value().clone());
    let conn = match known {
        Some(conn) => conn,
        None => {
            let is_hello = frames
                .get(1)
                .map_or(false, |f| f.options & OPT_HELLO != 0);
            if !is_hello {
                return (StatusCode::SERVICE_UNAVAILABLE, Bytes::new());
            }
            let conn = ServerConn::new(conn_idx, l.cipher, l.config.clone());
            l.conns.insert(conn_idx, conn.clone());
            debug!(conn = %conn, "new virtual connection");
            if l.pending_tx.try_send(conn.clone()).is_err() {
                // Accept backlog is full; the connection stays routable and
                // ages out through the GC if nobody ever claims it.
                debug!(conn = %conn, "pending backlog full, dropped");
            }
            conn
        }
    };

    conn.touch_active();

    let mut expected_ctr: Option<u32> = None;
    let mut peer_closed = false;
    for f in frames.iter().skip(1) {
        if let Some(expected) = expected_ctr.take() {
            if f.idx != expected {
                return (StatusCode::SERVICE_UNAVAILABLE, Bytes::new());
            }
        }
        if f.options & OPT_SYNC_CTR != 0 {
            expected_ctr = Some(f.idx);
            continue;
        }
        if f.options & OPT_CLOSED != 0 {
            peer_closed = true;
            continue;
        }
        if f.options & (OPT_HELLO | OPT_SYNC_CONN_IDX) != 0 {
            continue;
        }
        if conn.feed(f.clone()).await.is_err() {
            // Connection already closed on this side; stop feeding and let
            // the drain below carry the farewell frame back.
            break;
        }
    }

    let mut out = BytesMut::new();
    if peer_closed {
        debug!(conn = %conn, "closed by peer");
        conn.close_by_peer();
        l.conns.remove(&conn_idx);
    } else if conn.drain_into(&mut out, &l.cipher, l.config.max_read_buffer_size) {
        l.conns.remove(&conn_idx);
    }
    write_terminator(&mut out, &l.cipher);
    (StatusCode::OK, out.freeze())
}

/// Answer an orchestrator poll: one drain batch per listed connection, all
/// multiplexed into a single response chain.
fn pong(l: &ListenerShared, ids: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    for chunk in ids.chunks_exact(4) {
        let short = u32::from_be_bytes(chunk.try_into().expect("4-byte chunk"));
        let Some(conn) = l.find_by_short_id(short) else {
            continue;
        };
        conn.touch_active();
        if conn.drain_into(&mut out, &l.cipher, l.config.max_read_buffer_size) {
            l.conns.remove(&conn.conn_idx());
        }
    }
    write_terminator(&mut out, &l.cipher);
    out.freeze()
}

/// Collect connections that have gone quiet for a whole purge interval.
async fn gc_loop(shared: Arc<ListenerShared>) {
    let mut interval = tokio::time::interval(shared.config.inactive_purge);
    interval.tick().await;
    loop {
        interval.tick().await;
        let purge = shared.config.inactive_purge;
        shared.conns.retain(|_, conn| {
            if conn.idle_for() > purge {
                debug!(conn = %conn, "purging inactive connection");
                conn.close_by_peer();
                false
            } else {
                true
            }
        });
    }
}

async fn stats_loop(shared: Arc<ListenerShared>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        interval.tick().await;
        let pending: usize = shared.conns.iter().map(|e| e.value().pending_bytes()).sum();
        info!(
            active = shared.conns.len(),
            pending_bytes = pending,
            "listener stats"
        );
    }
}
