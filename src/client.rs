//! Client side of a virtual connection
//!
//! A `ClientConn` accumulates writes in a buffer and flushes it as a POST
//! request whose response body carries the server-to-client direction.
//! Flushes are triggered by an adaptive size threshold or by a 1-second
//! scheduled tick; idle ticks are coalesced with other connections by the
//! dialer's orchestrator. The write lock is held across the POST attempt,
//! so one outbound request per connection is in flight at any time.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, TunnelError};
use crate::frame::{marshal_chain, Frame, FrameCipher, OPT_CLOSED, OPT_HELLO, OPT_SYNC_CONN_IDX};
use crate::read_conn::ReadConn;
use crate::sched::SchedKey;

/// Scheduled flush interval.
const TICK: Duration = Duration::from_secs(1);

/// Poll interval while the write buffer is full.
const WRITE_RETRY: Duration = Duration::from_secs(1);

/// Pause between POST retries inside the inactive-purge envelope.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Margin subtracted from the purge interval so a final retry cannot land
/// on a connection the server is about to collect.
const RETRY_GRACE: Duration = Duration::from_secs(1);

/// Ceiling of the adaptive batch threshold.
const MAX_PENDING_SIZE: usize = 1024;

/// Capacity of the in-flight response channel.
const RESP_CHANNEL_SIZE: usize = 16;

/// Work item for the response drainers: either a whole response body to
/// parse, or a single frame already demultiplexed by the orchestrator.
pub(crate) enum RespNode {
    Body(reqwest::Response),
    Frame(Frame),
}

struct WriteBuf {
    /// Sequence number of the last flushed payload frame.
    counter: u32,
    buf: Vec<u8>,
}

pub(crate) struct ClientInner {
    idx: u64,
    endpoint: String,
    config: Config,
    cipher: FrameCipher,
    read: Arc<ReadConn>,
    write: tokio::sync::Mutex<WriteBuf>,
    /// Mirror of the write buffer length, readable without the write lock
    /// (the orchestrator partitions on it while a POST may be in flight).
    buffered: AtomicUsize,
    /// Adaptive batch threshold: doubled on each flush, reset to 1 by the
    /// idle tick.
    pending_size: AtomicUsize,
    sched: SchedKey,
    /// Present while the connection is open; taken once on close.
    resp_tx: parking_lot::Mutex<Option<mpsc::Sender<RespNode>>>,
    orch_tx: mpsc::Sender<ClientConn>,
}

/// A dialed virtual connection with socket semantics.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct ClientConn {
    inner: Arc<ClientInner>,
}

impl ClientConn {
    /// Dial the endpoint: allocate a random connection identifier, perform
    /// the hello exchange, and start the tick and the response drainers.
    pub(crate) async fn connect(
        endpoint: String,
        cipher: FrameCipher,
        config: Config,
        orch_tx: mpsc::Sender<ClientConn>,
    ) -> Result<ClientConn> {
        let idx: u64 = rand::thread_rng().gen();
        let (resp_tx, resp_rx) = mpsc::channel(RESP_CHANNEL_SIZE);
        let read = ReadConn::new(idx, cipher, 'c', config.max_write_buffer_size);

        let conn = ClientConn {
            inner: Arc::new(ClientInner {
                idx,
                endpoint,
                config,
                cipher,
                read,
                write: tokio::sync::Mutex::new(WriteBuf {
                    counter: 0,
                    buf: Vec::new(),
                }),
                buffered: AtomicUsize::new(0),
                pending_size: AtomicUsize::new(1),
                sched: SchedKey::new(),
                resp_tx: parking_lot::Mutex::new(Some(resp_tx)),
                orch_tx,
            }),
        };

        // Say hello
        let hello = marshal_chain(
            &[
                Frame::control(idx, OPT_SYNC_CONN_IDX),
                Frame::control(idx, OPT_HELLO),
            ],
            &conn.inner.cipher,
        );
        match conn.inner.send(hello).await {
            Ok(resp) => drop(resp),
            Err(e) => {
                conn.inner.read.close();
                return Err(e);
            }
        }

        conn.arm_tick();

        let rx = Arc::new(tokio::sync::Mutex::new(resp_rx));
        for _ in 0..2 {
            tokio::spawn(resp_loop(conn.clone(), rx.clone()));
        }

        debug!(conn = %conn, "dialed");
        Ok(conn)
    }

    pub fn conn_idx(&self) -> u64 {
        self.inner.idx
    }

    /// The HTTP endpoint this connection talks to; its only remote identity.
    /// There is no meaningful local address.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Bytes accepted by [`write`](Self::write) but not yet flushed to the
    /// carrier. Diagnostic only; the value may be stale by the time it
    /// returns.
    pub fn buffered(&self) -> usize {
        self.inner.buffered.load(Ordering::Relaxed)
    }

    /// Append to the write buffer, flushing when the adaptive threshold is
    /// reached. Blocks with a 1-second retry poll while the buffer is full.
    pub async fn write(&self, p: &[u8]) -> Result<usize> {
        loop {
            if let Some(e) = self.inner.read.err() {
                return Err(e);
            }
            if self.inner.read.is_closed() {
                return Err(TunnelError::ClosedConn);
            }
            if self.inner.buffered.load(Ordering::Relaxed)
                > self.inner.config.max_write_buffer_size
            {
                debug!(conn = %self, "write buffer is full");
                tokio::time::sleep(WRITE_RETRY).await;
                continue;
            }
            break;
        }

        let flush = {
            let mut w = self.inner.write.lock().await;
            self.arm_tick();
            w.buf.extend_from_slice(p);
            self.inner.buffered.store(w.buf.len(), Ordering::Relaxed);
            w.buf.len() >= self.inner.pending_size.load(Ordering::Relaxed)
        };
        if flush {
            self.sched_sending();
        }
        Ok(p.len())
    }

    pub async fn read(&self, p: &mut [u8]) -> Result<usize> {
        self.inner.read.read(p).await
    }

    /// Cancel the tick, evict readers, shut the response drainers down and
    /// tell the peer, best-effort. Idempotent.
    pub fn close(&self) {
        debug!(conn = %self, "closing");
        self.inner.sched.cancel();
        self.inner.read.close();
        if self.inner.resp_tx.lock().take().is_some() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let body = marshal_chain(
                    &[
                        Frame::control(inner.idx, OPT_SYNC_CONN_IDX),
                        Frame::control(inner.idx, OPT_CLOSED),
                    ],
                    &inner.cipher,
                );
                let _ = inner.send(body).await;
            });
        }
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

    /// Re-arm the 1-second tick. The callback resets the batch threshold
    /// before kicking the sending path, so an idle connection flushes (or
    /// polls) at least once per tick.
    fn arm_tick(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.sched.reschedule(
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.pending_size.store(1, Ordering::Relaxed);
                    ClientConn { inner }.sched_sending();
                }
            },
            TICK,
        );
    }

    /// Submit the connection to the orchestrator and keep the tick alive.
    fn sched_sending(&self) {
        if self.inner.read.err().is_some() || self.inner.read.is_closed() {
            self.close();
            return;
        }
        self.orch_send_write_buf();
        self.arm_tick();
    }

    /// Non-blocking orchestrator submission; under load it degrades into a
    /// direct send task.
    fn orch_send_write_buf(&self) {
        if self.inner.orch_tx.try_send(self.clone()).is_err() {
            let conn = self.clone();
            tokio::spawn(async move { conn.send_write_buf().await });
        }
    }

    /// Flush the write buffer as one POST, retrying failures until the
    /// inactive-purge envelope expires. Holds the write lock throughout.
    pub(crate) async fn send_write_buf(&self) {
        let inner = &self.inner;
        let mut w = inner.write.lock().await;

        let doubled = (inner.pending_size.load(Ordering::Relaxed) * 2).min(MAX_PENDING_SIZE);
        inner.pending_size.store(doubled, Ordering::Relaxed);

        if inner.read.err().is_some() {
            return;
        }

        let body = marshal_chain(
            &[
                Frame::control(inner.idx, OPT_SYNC_CONN_IDX),
                Frame::payload(
                    w.counter.wrapping_add(1),
                    inner.idx,
                    Bytes::copy_from_slice(&w.buf),
                ),
            ],
            &inner.cipher,
        );

        let give_up = Instant::now() + inner.config.inactive_purge.saturating_sub(RETRY_GRACE);
        loop {
            match inner.send(body.clone()).await {
                Ok(resp) => {
                    w.buf.clear();
                    inner.buffered.store(0, Ordering::Relaxed);
                    w.counter = w.counter.wrapping_add(1);
                    let tx = inner.resp_tx.lock().clone();
                    if let Some(tx) = tx {
                        // Ignored when the connection tore down underneath us.
                        let _ = tx.send(RespNode::Body(resp)).await;
                    }
                    return;
                }
                Err(e) => {
                    if Instant::now() >= give_up {
                        inner.read.feed_error(e);
                        return;
                    }
                    warn!(conn = %self, error = %e, "post failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    /// Issue one POST through this connection's endpoint. Used for data
    /// flushes and for orchestrator pings alike.
    pub(crate) async fn send_raw(&self, body: Bytes) -> Result<reqwest::Response> {
        self.inner.send(body).await
    }

    pub(crate) fn read_side(&self) -> &Arc<ReadConn> {
        &self.inner.read
    }

    pub(crate) fn cipher(&self) -> &FrameCipher {
        &self.inner.cipher
    }

    pub(crate) fn resp_sender(&self) -> Option<mpsc::Sender<RespNode>> {
        self.inner.resp_tx.lock().clone()
    }
}

impl ClientInner {
    async fn send(&self, body: Bytes) -> Result<reqwest::Response> {
        let client = self.config.request_client();
        let resp = client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(TunnelError::RemoteUnavailable(resp.status().to_string()));
        }
        Ok(resp)
    }
}

/// Drain the response channel: whole bodies are read (capped by the client
/// read timeout) and fed through the read side; orchestrator-delivered
/// frames go in directly. Two drainers run per connection so a multiplexed
/// ping response and a direct POST response can make progress in parallel.
async fn resp_loop(
    conn: ClientConn,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RespNode>>>,
) {
    loop {
        let node = { rx.lock().await.recv().await };
        match node {
            None => return,
            Some(RespNode::Body(resp)) => {
                let read_cap = conn.inner.config.client_read_timeout;
                match tokio::time::timeout(read_cap, resp.bytes()).await {
                    Ok(Ok(bytes)) => {
                        let mut src = bytes;
                        let _ = conn.inner.read.feed_frames(&mut src).await;
                    }
                    Ok(Err(e)) => debug!(conn = %conn, error = %e, "response body failed"),
                    Err(_) => debug!(conn = %conn, "response body read timed out"),
                }
            }
            Some(RespNode::Frame(f)) => {
                if conn.inner.read.err().is_none() && !conn.inner.read.is_closed() {
                    debug!(conn = %conn, idx = f.idx, "orchestrated frame");
                    let _ = conn.inner.read.feed_frame(f).await;
                }
            }
        }
    }
}

impl fmt::Display for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The write counter is skipped when an in-flight POST holds the lock.
        match self.inner.write.try_lock() {
            Ok(w) => write!(
                f,
                "<ClientConn:{:x},r:{},w:{}>",
                self.inner.idx,
                self.inner.read.counter(),
                w.counter
            ),
            Err(_) => write!(
                f,
                "<ClientConn:{:x},r:{},w:?>",
                self.inner.idx,
                self.inner.read.counter()
            ),
        }
    }
}
