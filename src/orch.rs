//! Orchestrator: batched polling for idle connections
//!
//! Every client connection resubmits itself here once per tick. Each cycle
//! drains submissions for a short window, hands connections with buffered
//! data to their own send task, and folds the idle remainder into a single
//! ping POST listing their identifiers. The multiplexed response is parsed
//! here and demultiplexed back to the owning connections, so N idle
//! connections cost one HTTP request instead of N.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::debug;

use crate::client::{ClientConn, RespNode};
use crate::error::TunnelError;
use crate::frame::{marshal_chain, parse_frame, Frame, OPT_CLOSED, OPT_PING, OPT_SYNC_CONN_IDX};

/// Idle gap that closes a batch; every submission re-arms it.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Pause after a cycle with nothing to do.
const IDLE_SLEEP: Duration = Duration::from_millis(200);

/// Capacity of the submission channel; overflow degrades into direct sends.
pub(crate) const ORCH_CHANNEL_SIZE: usize = 256;

/// One orchestrator runs per dialer, for the dialer's lifetime.
pub(crate) async fn run(mut rx: mpsc::Receiver<ClientConn>) {
    loop {
        let mut conns: HashMap<u64, ClientConn> = HashMap::new();
        let mut window = Instant::now() + DRAIN_WINDOW;
        loop {
            match timeout_at(window, rx.recv()).await {
                Ok(Some(conn)) => {
                    conns.insert(conn.conn_idx(), conn);
                    // The window slides: a batch closes only once the
                    // channel has been quiet for the whole gap.
                    window = Instant::now() + DRAIN_WINDOW;
                }
                // Dialer and every connection are gone.
                Ok(None) => return,
                Err(_) => break,
            }
        }

        if conns.is_empty() {
            sleep(IDLE_SLEEP).await;
            continue;
        }

        let mut poll_ids = BytesMut::new();
        let mut direct = 0usize;
        let mut lastconn: Option<ClientConn> = None;
        for conn in conns.values() {
            if conn.buffered() > 0 {
                // Actual data waiting; flush it on its own task.
                let conn = conn.clone();
                tokio::spawn(async move { conn.send_write_buf().await });
                direct += 1;
                continue;
            }
            poll_ids.put_u32(conn.conn_idx() as u32);
            lastconn = Some(conn.clone());
        }

        let Some(lastconn) = lastconn else {
            debug!(direct, "orch: cycle sent directly");
            continue;
        };

        let mut ping = Frame::control(0, OPT_PING);
        ping.data = poll_ids.freeze();
        let body = marshal_chain(&[ping], lastconn.cipher());
        tokio::spawn(poll(lastconn, conns, body, direct));
    }
}

/// Carry one ping POST and route the multiplexed response. Failures are
/// logged and dropped; the polled connections simply try again next tick.
async fn poll(lastconn: ClientConn, conns: HashMap<u64, ClientConn>, body: Bytes, direct: usize) {
    let resp = match lastconn.send_raw(body).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, "orch: poll failed");
            return;
        }
    };
    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "orch: poll body failed");
            return;
        }
    };

    let mut src = bytes;
    let mut positives = 0usize;
    let mut psize = 0usize;
    loop {
        let Some(f) = parse_frame(&mut src, lastconn.cipher()) else {
            break;
        };
        if f.is_terminator() {
            break;
        }
        // Batch markers scope the frames that follow, but every frame also
        // carries its owner, so routing goes by that.
        if f.options & OPT_SYNC_CONN_IDX != 0 {
            continue;
        }
        let Some(conn) = conns.get(&f.conn_idx) else {
            continue;
        };
        let read = conn.read_side();
        if read.is_closed() || read.err().is_some() {
            continue;
        }
        if f.options & OPT_CLOSED != 0 {
            debug!(conn = %conn, "orch: the other side is closed");
            read.feed_error(TunnelError::ClosedConn);
            conn.close();
            continue;
        }
        psize += f.data.len();
        if let Some(tx) = conn.resp_sender() {
            if tx.send(RespNode::Frame(f)).await.is_ok() {
                positives += 1;
            }
        }
    }
    debug!(
        pings = conns.len() - direct,
        positives,
        bytes = psize,
        direct,
        "orch: cycle"
    );
}
