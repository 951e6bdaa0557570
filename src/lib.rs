//! # htun
//!
//! Reliable, ordered, full-duplex byte streams ("virtual connections")
//! tunneled over an unmodified HTTP/1.1 request/response carrier.
//!
//! A client dials a logical endpoint and gets back a bidirectional stream
//! with conventional socket semantics (read, write, close, deadlines); a
//! server accepts such streams from ordinary HTTP POST requests. Frames are
//! encrypted with AES-128-CTR so an on-path observer sees only opaque POST
//! bodies.
//!
//! ## Architecture
//!
//! - [`frame`] — the wire codec: length-prefixed encrypted frames chained
//!   into envelopes terminated by a sentinel.
//! - [`ClientConn`] — buffers writes and flushes them as POST requests;
//!   response bodies carry the server-to-client direction.
//! - [`Listener`] / [`ServerConn`] — a single `POST /` HTTP handler routing
//!   frames to virtual connections by identifier.
//! - The per-dialer orchestrator coalesces idle polling of many connections
//!   into one multiplexed ping request.
//!
//! ## Example
//!
//! ```no_run
//! # async fn example() -> htun::Result<()> {
//! let listener = htun::listen("net1", "127.0.0.1:20001").await?;
//! tokio::spawn(async move {
//!     while let Ok(conn) = listener.accept().await {
//!         tokio::spawn(async move {
//!             let mut buf = [0u8; 4096];
//!             while let Ok(n) = conn.read(&mut buf).await {
//!                 if conn.write(&buf[..n]).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!     }
//! });
//!
//! let conn = htun::dial("net1", "127.0.0.1:20001").await?;
//! conn.write(b"hello world tunnel!").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod frame;

mod client;
mod dialer;
mod orch;
mod read_conn;
mod sched;
mod server;
mod wait;

pub use client::ClientConn;
pub use config::Config;
pub use dialer::{dial, listen, listen_with_config, Dialer};
pub use error::{Result, TunnelError};
pub use server::{Listener, ServerConn};
