//! End-to-end relay tests: fake upstream caster, real relay, real clients

mod common;

use bytes::{Bytes, BytesMut};
use common::*;
use ntrip_relay::metrics::StatusSource;
use ntrip_relay::protocol::NtripHandler;
use ntrip_relay::supervisor::SupervisorState;
use ntrip_relay::{Caster, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;

/// Upstream caster that accepts sessions one at a time and writes whatever
/// it is told to. A `None` closes the current session.
struct FakeCaster {
    addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedSender<Option<Bytes>>,
}

async fn fake_caster() -> FakeCaster {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted_tx, accepted) = mpsc::unbounded_channel();
    let (commands, mut command_rx) = mpsc::unbounded_channel::<Option<Bytes>>();

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let mut handler = NtripHandler::new(socket);
            let head = match handler.read_head().await {
                Ok(head) => head,
                Err(_) => continue,
            };
            let mut socket: TcpStream = handler.into_stream();
            if socket.write_all(b"ICY 200 OK\r\n\r\n").await.is_err() {
                continue;
            }
            let _ = accepted_tx.send(head.text);

            while let Some(command) = command_rx.recv().await {
                match command {
                    Some(data) => {
                        if socket.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    FakeCaster {
        addr,
        accepted,
        commands,
    }
}

fn relay_config(upstream: SocketAddr) -> Config {
    let mut config = Config::default();
    config.upstream.host = upstream.ip().to_string();
    config.upstream.port = upstream.port();
    config.upstream.mountpoint = "RTCM4".to_string();
    config.upstream.username = "rover".to_string();
    config.upstream.password = "secret".to_string();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.reconnect.initial_delay = Duration::from_millis(50);
    config.reconnect.max_delay = Duration::from_millis(200);
    config.server.shutdown_timeout = Duration::from_secs(1);
    config
}

async fn next_session(caster: &mut FakeCaster) -> String {
    tokio::time::timeout(Duration::from_secs(5), caster.accepted.recv())
        .await
        .expect("relay did not connect upstream")
        .expect("fake caster stopped")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_relay_across_upstream_reconnect() {
    let mut upstream = fake_caster().await;

    let mut caster = Caster::new(Arc::new(relay_config(upstream.addr)));
    let addr = caster.bind().await.unwrap();
    let hub = caster.hub();
    let stats = caster.stats();
    let status = caster.status_source();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let relay = tokio::spawn(caster.run(shutdown_rx));

    let request = next_session(&mut upstream).await;
    assert!(request.starts_with("GET /RTCM4 HTTP/1.1"));
    assert!(request.contains("Authorization: Basic cm92ZXI6c2VjcmV0"));

    wait_until("upstream streaming", || {
        let status = Arc::clone(&status);
        async move { status.status().upstream.state == SupervisorState::Streaming }
    })
    .await;

    // Client A joins before any data
    let (mut client_a, head_a, rest_a) = open_stream(addr, &v2_request("RTCM4", None)).await;
    assert!(head_a.starts_with("HTTP/1.1 200 OK"));
    wait_until("client A registered", || {
        let hub = Arc::clone(&hub);
        async move { hub.subscriber_count() == 1 }
    })
    .await;

    // Three frames in a single upstream chunk
    let mut first = BytesMut::new();
    first.extend_from_slice(&frame(1074, 60));
    first.extend_from_slice(&frame(1005, 19));
    first.extend_from_slice(&frame(1077, 80));
    let first = first.freeze();
    upstream.commands.send(Some(first.clone())).unwrap();

    let received = read_exact_with(&mut client_a, rest_a, first.len()).await;
    assert_eq!(received, first.to_vec(), "relay must forward bytes verbatim");

    wait_until("frames counted", || {
        let stats = Arc::clone(&stats);
        async move { stats.snapshot().valid_frames == 3 }
    })
    .await;
    let counts = stats.snapshot().message_counts;
    assert_eq!(counts.get(&1074), Some(&1));
    assert_eq!(counts.get(&1005), Some(&1));
    assert_eq!(counts.get(&1077), Some(&1));
    assert_eq!(counts.len(), 3);

    // Client B joins after the chunk and before the upstream drops
    let (mut client_b, head_b, rest_b) = open_stream(addr, &v2_request("RTCM4", None)).await;
    assert!(head_b.starts_with("HTTP/1.1 200 OK"));
    wait_until("client B registered", || {
        let hub = Arc::clone(&hub);
        async move { hub.subscriber_count() == 2 }
    })
    .await;

    // Upstream drops; the relay reconnects on its own
    upstream.commands.send(None).unwrap();
    next_session(&mut upstream).await;
    wait_until("upstream streaming again", || {
        let status = Arc::clone(&status);
        async move { status.status().upstream.state == SupervisorState::Streaming }
    })
    .await;
    assert_eq!(stats.snapshot().reconnects, 1);
    // Both clients stayed attached through the outage
    assert_eq!(hub.subscriber_count(), 2);

    // Nothing reached client B across the outage
    assert!(rest_b.is_empty());
    let mut buf = [0u8; 64];
    let idle = tokio::time::timeout(Duration::from_millis(200), client_b.read(&mut buf)).await;
    assert!(idle.is_err(), "client B received bytes before the first broadcast");

    let second = frame(1230, 12);
    upstream.commands.send(Some(second.clone())).unwrap();

    let received_a = read_exact_with(&mut client_a, Vec::new(), second.len()).await;
    let received_b = read_exact_with(&mut client_b, rest_b, second.len()).await;
    assert_eq!(received_a, second.to_vec());
    assert_eq!(received_b, second.to_vec());

    wait_until("second session counted", || {
        let stats = Arc::clone(&stats);
        async move { stats.snapshot().valid_frames == 4 }
    })
    .await;
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.bytes_received, (first.len() + second.len()) as u64);
    assert_eq!(snapshot.message_counts.get(&1230), Some(&1));

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay did not shut down")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unreachable_upstream_keeps_serving_clients() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let unreachable = listener.local_addr().unwrap();
    drop(listener);

    let mut caster = Caster::new(Arc::new(relay_config(unreachable)));
    let addr = caster.bind().await.unwrap();
    let hub = caster.hub();
    let status = caster.status_source();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let relay = tokio::spawn(caster.run(shutdown_rx));

    wait_until("upstream failure recorded", || {
        let status = Arc::clone(&status);
        async move { status.status().upstream.last_error.is_some() }
    })
    .await;

    // Local clients are still accepted while the upstream is down
    let (_client, head, _) = open_stream(addr, &v2_request("RTCM4", None)).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    wait_until("client registered", || {
        let hub = Arc::clone(&hub);
        async move { hub.subscriber_count() == 1 }
    })
    .await;

    let snapshot = status.status();
    assert!(snapshot.upstream.last_error.unwrap().contains("failed to connect"));
    assert_eq!(snapshot.subscribers.len(), 1);
    assert_eq!(snapshot.access.granted, 1);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay did not shut down")
        .unwrap()
        .unwrap();
}
