//! Loopback integration tests over real TCP sockets, covering the
//! concrete scenarios from spec §8 that don't require a TLS/WS/mux
//! carrier to exercise ByteShuttle's contract.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use aether_tunnel_core::shuttle;

async fn echo_server(listener: TcpListener) {
    loop {
        let (mut conn, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if conn.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Scenario 1 (spec §8): plain TCP tunnel, byte-faithful round trip.
#[tokio::test]
async fn plain_tunnel_echoes_bytes_byte_faithfully() {
    let echo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo_listener.local_addr().unwrap();
    tokio::spawn(echo_server(echo_listener));

    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel_listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (inbound, _) = tunnel_listener.accept().await.unwrap();
        let outbound = TcpStream::connect(echo_addr).await.unwrap();
        shuttle(inbound, outbound, Duration::from_secs(5))
            .await
            .ok();
    });

    let mut client = TcpStream::connect(tunnel_addr).await.unwrap();
    let payload: Vec<u8> = (0..16u8).collect();
    client.write_all(&payload).await.unwrap();

    let mut received = vec![0u8; payload.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);
}

/// Scenario 6 (spec §8): a short idle timeout tears down both directions
/// within roughly one timeout interval even though both ends stay open.
#[tokio::test]
async fn idle_timeout_tears_down_silent_tunnel() {
    let right_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let right_addr = right_listener.local_addr().unwrap();
    let right_accept = tokio::spawn(async move { right_listener.accept().await.unwrap().0 });

    let left_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let left_addr = left_listener.local_addr().unwrap();
    let left_accept = tokio::spawn(async move { left_listener.accept().await.unwrap().0 });

    let mut client_left = TcpStream::connect(left_addr).await.unwrap();
    let mut client_right = TcpStream::connect(right_addr).await.unwrap();

    let inbound = left_accept.await.unwrap();
    let outbound = right_accept.await.unwrap();

    let shuttle_task = tokio::spawn(shuttle(inbound, outbound, Duration::from_secs(1)));

    client_left.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    client_right.read_exact(&mut buf).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), shuttle_task)
        .await
        .expect("shuttle did not tear down within the expected window")
        .unwrap();
    assert!(result.is_err());

    // Both sides observe the tunnel going away.
    let mut buf = [0u8; 1];
    assert_eq!(client_left.read(&mut buf).await.unwrap(), 0);
    assert_eq!(client_right.read(&mut buf).await.unwrap(), 0);
}
