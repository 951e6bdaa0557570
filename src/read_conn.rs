//! Read side of a virtual connection
//!
//! Frames arrive from response bodies (client side) or request bodies
//! (server side) in arbitrary order. A bounded channel hands them to a
//! single reassembly task that holds frames which arrived early, drains
//! consecutive sequence numbers into a contiguous byte buffer, and wakes
//! blocked readers through the wait object.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::frame::{
    parse_frame, Frame, FrameCipher, OPT_CLOSED, OPT_HELLO, OPT_PING, OPT_SYNC_CONN_IDX,
    OPT_SYNC_CTR,
};
use crate::wait::WaitObject;

/// Capacity of the incoming-frame channel.
const FRAME_CHANNEL_SIZE: usize = 1024;

struct Shared {
    /// Sequence number of the last frame drained into `buf`; must stay in
    /// sync with the writer's counter on the other side.
    counter: u32,
    /// In-order bytes not yet consumed by the application.
    buf: BytesMut,
    /// Frames which have arrived early, keyed by sequence number.
    future: HashMap<u32, Frame>,
    /// Total payload bytes held in `future`.
    future_size: usize,
    closed: bool,
    /// Sticky error; once present, every operation afterwards returns it.
    err: Option<TunnelError>,
    /// Present while the connection is open; taken under this same lock on
    /// close so a feed can never race a closing channel.
    frames_tx: Option<mpsc::Sender<Frame>>,
}

pub(crate) struct ReadConn {
    conn_idx: u64,
    /// 'c' on the client side, 's' on the server side; only shows up in logs.
    tag: char,
    cipher: FrameCipher,
    /// Bound on `future_size`; exceeding it with no forward progress means a
    /// frame was lost for good.
    max_future_size: usize,
    shared: Mutex<Shared>,
    /// Touched when bytes land in `buf`.
    ready: WaitObject,
}

enum Ingest {
    Progress,
    Stale,
    Fatal(TunnelError),
    Closed,
}

impl ReadConn {
    pub fn new(conn_idx: u64, cipher: FrameCipher, tag: char, max_future_size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        let conn = Arc::new(Self {
            conn_idx,
            tag,
            cipher,
            max_future_size,
            shared: Mutex::new(Shared {
                counter: 0,
                buf: BytesMut::new(),
                future: HashMap::new(),
                future_size: 0,
                closed: false,
                err: None,
                frames_tx: Some(tx),
            }),
            ready: WaitObject::new(),
        });
        tokio::spawn(rearrange_loop(conn.clone(), rx));
        conn
    }

    pub fn err(&self) -> Option<TunnelError> {
        self.shared.lock().err.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn counter(&self) -> u32 {
        self.shared.lock().counter
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.ready.set_wait_deadline(deadline);
    }

    /// Hand one payload frame to the reassembly task.
    pub async fn feed_frame(&self, f: Frame) -> Result<()> {
        let tx = {
            let s = self.shared.lock();
            if let Some(e) = &s.err {
                return Err(e.clone());
            }
            if s.closed {
                return Err(TunnelError::ClosedConn);
            }
            s.frames_tx.clone()
        };
        match tx {
            Some(tx) => tx.send(f).await.map_err(|_| TunnelError::ClosedConn),
            None => Err(TunnelError::ClosedConn),
        }
    }

    /// Ingest an envelope until its sentinel, routing payload frames to the
    /// reassembly task and consuming control frames in place.
    ///
    /// Returns the number of payload bytes fed. A malformed frame or a
    /// checkpoint mismatch poisons the connection.
    pub async fn feed_frames(&self, src: &mut impl Buf) -> Result<usize> {
        let mut count = 0usize;
        let mut expected_ctr: Option<u32> = None;
        loop {
            let f = match parse_frame(src, &self.cipher) {
                Some(f) => f,
                None => {
                    self.feed_error(TunnelError::InvalidFrames);
                    return Err(TunnelError::InvalidFrames);
                }
            };
            if f.is_terminator() {
                break;
            }
            if let Some(expected) = expected_ctr.take() {
                if f.idx != expected {
                    self.feed_error(TunnelError::UnsyncedCounter);
                    return Err(TunnelError::UnsyncedCounter);
                }
            }
            if f.options & OPT_SYNC_CTR != 0 {
                expected_ctr = Some(f.idx);
                continue;
            }
            if f.options & OPT_CLOSED != 0 {
                debug!(conn = %self, "peer closed");
                self.close();
                return Ok(count);
            }
            if f.options & (OPT_SYNC_CONN_IDX | OPT_HELLO | OPT_PING) != 0 {
                continue;
            }
            count += f.data.len();
            self.feed_frame(f).await?;
        }
        Ok(count)
    }

    /// Sticky-fail the connection and evict everyone.
    pub fn feed_error(&self, err: TunnelError) {
        {
            let mut s = self.shared.lock();
            if s.err.is_none() {
                s.err = Some(err);
            }
        }
        self.ready.touch();
        self.close();
    }

    /// Idempotent. Drops the frame channel under the lock and forces the
    /// wait deadline to now so parked readers wake immediately.
    pub fn close(&self) {
        {
            let mut s = self.shared.lock();
            if s.closed {
                return;
            }
            s.closed = true;
            s.frames_tx = None;
        }
        self.ready.set_wait_deadline(Some(Instant::now()));
    }

    /// Blocking read: returns buffered bytes when any are present, otherwise
    /// parks on the wait object until data, close, or deadline.
    pub async fn read(&self, p: &mut [u8]) -> Result<usize> {
        loop {
            {
                let s = self.shared.lock();
                if let Some(e) = &s.err {
                    return Err(e.clone());
                }
                if s.closed {
                    return Err(TunnelError::ClosedConn);
                }
            }

            if self.ready.is_timedout() {
                return Err(TunnelError::Timeout);
            }

            {
                let mut s = self.shared.lock();
                if !s.buf.is_empty() {
                    let n = p.len().min(s.buf.len());
                    p[..n].copy_from_slice(&s.buf[..n]);
                    s.buf.advance(n);
                    return Ok(n);
                }
            }

            let (_, ontime) = self.ready.wait().await;

            {
                let s = self.shared.lock();
                if let Some(e) = &s.err {
                    return Err(e.clone());
                }
                if s.closed {
                    return Err(TunnelError::ClosedConn);
                }
            }
            if !ontime {
                return Err(TunnelError::Timeout);
            }
        }
    }

    fn ingest(&self, f: Frame) -> Ingest {
        let mut s = self.shared.lock();
        if s.closed || s.err.is_some() {
            return Ingest::Closed;
        }
        if f.conn_idx != self.conn_idx {
            return Ingest::Fatal(TunnelError::UnmatchedStreamIndex);
        }
        if f.idx <= s.counter {
            // Duplicate or stale; happens legitimately when the server GC'd
            // the connection state and the client retried a POST.
            return Ingest::Stale;
        }

        s.future_size += f.data.len();
        if let Some(old) = s.future.insert(f.idx, f) {
            s.future_size -= old.data.len();
        }

        loop {
            let next = s.counter.wrapping_add(1);
            match s.future.remove(&next) {
                Some(g) => {
                    s.future_size -= g.data.len();
                    s.buf.extend_from_slice(&g.data);
                    s.counter = next;
                }
                None => {
                    if s.future_size > self.max_future_size {
                        return Ingest::Fatal(TunnelError::MissingFrame);
                    }
                    break;
                }
            }
        }
        Ingest::Progress
    }
}

/// Single consumer of the frame channel; owns all counter bookkeeping.
async fn rearrange_loop(conn: Arc<ReadConn>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(f) = rx.recv().await {
        match conn.ingest(f) {
            Ingest::Progress => conn.ready.touch(),
            Ingest::Stale => {}
            Ingest::Fatal(e) => {
                debug!(conn = %conn, error = %e, "reassembly failed");
                conn.feed_error(e);
                return;
            }
            Ingest::Closed => return,
        }
    }
}

impl fmt::Display for ReadConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<readConn:{:x},{},ctr:{}>",
            self.conn_idx,
            self.tag,
            self.counter()
        )
    }
}
