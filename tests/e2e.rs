//! End-to-end scenarios: real listener and dialer pairs over loopback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use htun::{Dialer, TunnelError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "htun=info".into()),
        )
        .try_init();
}

/// Start an echo server on an ephemeral port and return its address.
async fn spawn_echo(network: &'static str) -> std::net::SocketAddr {
    let listener = htun::listen(network, "127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr();
    tokio::spawn(async move {
        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(n) => {
                            if conn.write(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => return,
                    }
                }
            });
        }
    });
    addr
}

async fn read_exactly(conn: &htun::ClientConn, want: usize, deadline: Duration) -> Vec<u8> {
    conn.set_read_deadline(Some(Instant::now() + deadline));
    let mut got = Vec::with_capacity(want);
    let mut buf = vec![0u8; 64 * 1024];
    while got.len() < want {
        let n = conn.read(&mut buf).await.unwrap();
        got.extend_from_slice(&buf[..n]);
    }
    conn.set_read_deadline(None);
    got
}

/// A TCP forwarder that delays every server-to-client chunk by a random
/// 0-5 ms, so concurrent response bodies finish out of order and the
/// reassembly path actually has to reorder.
async fn spawn_delay_proxy(upstream: std::net::SocketAddr) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut seed = 0x9e37_79b9_7f4a_7c15u64;
        loop {
            let (client, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let mut x = seed;
            tokio::spawn(async move {
                let server = match tokio::net::TcpStream::connect(upstream).await {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let (mut client_rd, mut client_wr) = client.into_split();
                let (mut server_rd, mut server_wr) = server.into_split();
                // Requests pass through untouched.
                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut client_rd, &mut server_wr).await;
                });
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    let n = match server_rd.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    x ^= x >> 12;
                    x ^= x << 25;
                    x ^= x >> 27;
                    let delay = x.wrapping_mul(0x2545_F491_4F6C_DD1D) % 6;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if client_wr.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

/// Deterministic xorshift64* byte stream.
fn prng_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut x = seed;
    let mut v = Vec::with_capacity(len + 8);
    while v.len() < len {
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        v.extend_from_slice(&x.wrapping_mul(0x2545_F491_4F6C_DD1D).to_le_bytes());
    }
    v.truncate(len);
    v
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_round_trip() {
    init_tracing();
    let addr = spawn_echo("net1").await;
    let conn = htun::dial("net1", &addr.to_string()).await.unwrap();

    conn.write(b"hello world tunnel!").await.unwrap();
    let got = read_exactly(&conn, 19, Duration::from_secs(15)).await;
    assert_eq!(&got, b"hello world tunnel!");

    conn.close();
    let mut buf = [0u8; 8];
    assert!(matches!(
        conn.read(&mut buf).await,
        Err(TunnelError::ClosedConn)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bulk_transfer_integrity() {
    init_tracing();
    let addr = spawn_echo("net2").await;
    // The random-delay carrier makes response bodies complete out of order.
    let addr = spawn_delay_proxy(addr).await;
    let conn = htun::dial("net2", &addr.to_string()).await.unwrap();

    const CHUNK: usize = 1500;
    let max_buffer = htun::Config::default().max_write_buffer_size;
    let peak = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let conn = conn.clone();
        let peak = peak.clone();
        tokio::spawn(async move {
            loop {
                peak.fetch_max(conn.buffered(), Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let data = prng_bytes(42, 4 * 1024 * 1024);
    let writer = {
        let conn = conn.clone();
        let data = data.clone();
        tokio::spawn(async move {
            for chunk in data.chunks(CHUNK) {
                conn.write(chunk).await.unwrap();
            }
        })
    };

    let got = read_exactly(&conn, data.len(), Duration::from_secs(120)).await;
    writer.await.unwrap();
    sampler.abort();

    assert!(got == data, "echoed stream differs from what was sent");
    let peak = peak.load(Ordering::Relaxed);
    assert!(
        peak <= max_buffer + CHUNK,
        "write buffer peaked at {peak} bytes"
    );
    conn.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_connections_isolated() {
    init_tracing();
    let addr = spawn_echo("net3").await;
    let dialer = Arc::new(Dialer::new("net3", &addr.to_string()));

    let mut tasks = Vec::new();
    for i in 0..100u32 {
        let dialer = dialer.clone();
        tasks.push(tokio::spawn(async move {
            let conn = dialer.dial().await.unwrap();
            let id = format!("{i:08}-012345678901234");
            assert_eq!(id.len(), 24);
            conn.write(id.as_bytes()).await.unwrap();
            let got = read_exactly(&conn, id.len(), Duration::from_secs(60)).await;
            assert_eq!(got, id.as_bytes(), "cross-talk on connection {i}");
            conn.close();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_deadline_fires() {
    init_tracing();
    let addr = spawn_echo("net4").await;
    let conn = htun::dial("net4", &addr.to_string()).await.unwrap();

    conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(200)));
    let start = Instant::now();
    let mut buf = [0u8; 8];
    let err = conn.read(&mut buf).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_timeout());
    assert!(!err.is_temporary());
    assert!(elapsed >= Duration::from_millis(170), "woke early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(600), "woke late: {elapsed:?}");
    conn.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writes_across_ticks_stay_ordered() {
    init_tracing();
    let addr = spawn_echo("net5").await;
    let conn = htun::dial("net5", &addr.to_string()).await.unwrap();

    // Two writes separated by more than the flush tick travel in separate
    // requests; the peer still sees one contiguous stream.
    conn.write(b"A").await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    conn.write(b"B").await.unwrap();

    let got = read_exactly(&conn, 2, Duration::from_secs(15)).await;
    assert_eq!(&got, b"AB");
    conn.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_close_propagates() {
    init_tracing();
    let listener = Arc::new(htun::listen("net6", "127.0.0.1:0").await.unwrap());
    let addr = listener.local_addr();

    let accepted = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await })
    };
    let conn = htun::dial("net6", &addr.to_string()).await.unwrap();
    let server_conn = accepted.await.unwrap().unwrap();

    server_conn.close();

    // The idle client's next poll carries the farewell frame back.
    conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(10)));
    let mut buf = [0u8; 8];
    assert!(matches!(
        conn.read(&mut buf).await,
        Err(TunnelError::ClosedConn)
    ));
    assert!(matches!(
        conn.write(b"x").await,
        Err(TunnelError::ClosedConn)
    ));

    // And the listener forgets the connection.
    let deadline = Instant::now() + Duration::from_secs(5);
    while listener.active_conns() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(listener.active_conns(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_close_notifies_server() {
    init_tracing();
    let listener = Arc::new(htun::listen("net7", "127.0.0.1:0").await.unwrap());
    let addr = listener.local_addr();

    let accepted = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await })
    };
    let conn = htun::dial("net7", &addr.to_string()).await.unwrap();
    let server_conn = accepted.await.unwrap().unwrap();

    conn.close();
    conn.close(); // idempotent

    server_conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(10)));
    let mut buf = [0u8; 8];
    assert!(matches!(
        server_conn.read(&mut buf).await,
        Err(TunnelError::ClosedConn)
    ));

    let deadline = Instant::now() + Duration::from_secs(5);
    while listener.active_conns() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(listener.active_conns(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_accept_after_listener_close() {
    init_tracing();
    let listener = htun::listen("net8", "127.0.0.1:0").await.unwrap();
    listener.close();
    assert!(matches!(
        listener.accept().await,
        Err(TunnelError::ListenerClosed)
    ));
}
