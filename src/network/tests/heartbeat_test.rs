use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;

use super::{client_config, server_config, wait_until, Recording};
use crate::codec::LengthFieldCodec;
use crate::network::{HeartbeatFactory, TcpClient, TcpServer};
use crate::service::HeartbeatPolicy;
use crate::session::{CloseReason, Listener, Session};

/// Accepts connections and never sends anything back.
struct Silent;

impl Listener<Bytes> for Silent {
    fn on_receive(&self, _session: &Arc<Session<Bytes>>, _msg: Bytes) {}
}

/// Pushes a frame at a steady cadence for as long as the session accepts it.
struct Chatty;

impl Listener<Bytes> for Chatty {
    fn on_connect(&self, session: &Arc<Session<Bytes>>) {
        let session = session.clone();
        tokio::spawn(async move {
            while session.send(Bytes::from_static(b"tick")).is_ok() {
                sleep(Duration::from_millis(25)).await;
            }
        });
    }

    fn on_receive(&self, _session: &Arc<Session<Bytes>>, _msg: Bytes) {}
}

fn ping_factory() -> Arc<dyn HeartbeatFactory<Bytes>> {
    Arc::new(|| Bytes::from_static(b"ping"))
}

fn fast_heartbeat() -> HeartbeatPolicy {
    HeartbeatPolicy {
        interval_ms: 50,
        timeout_ms: 150,
        threshold: 2,
    }
}

#[tokio::test]
async fn test_silent_peer_is_force_closed() {
    let server = Arc::new(TcpServer::new(
        "silent",
        server_config(),
        LengthFieldCodec::default(),
        Silent,
    ));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client_listener = Recording::new();
    let mut config = client_config(port);
    config.heartbeat = Some(fast_heartbeat());
    let client = Arc::new(TcpClient::new(
        "hb",
        config,
        LengthFieldCodec::default(),
        client_listener.clone(),
        Some(ping_factory()),
    ));
    client.connect().await.unwrap();

    wait_until("heartbeat close", || client_listener.closes() == 1).await;
    assert_eq!(
        client_listener.close_reasons.lock()[0],
        CloseReason::HeartbeatTimeout
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_steady_traffic_keeps_session_open() {
    let server = Arc::new(TcpServer::new(
        "chatty",
        server_config(),
        LengthFieldCodec::default(),
        Chatty,
    ));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client_listener = Recording::new();
    let mut config = client_config(port);
    config.heartbeat = Some(fast_heartbeat());
    let client = Arc::new(TcpClient::new(
        "hb",
        config,
        LengthFieldCodec::default(),
        client_listener.clone(),
        Some(ping_factory()),
    ));
    client.connect().await.unwrap();

    // several full timeout windows of inbound traffic, no close
    sleep(Duration::from_millis(600)).await;
    assert_eq!(client_listener.closes(), 0);
    assert!(!client_listener.received.lock().is_empty());
    assert!(client.session().unwrap().is_open());

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_without_factory_is_disabled() {
    let server = Arc::new(TcpServer::new(
        "silent",
        server_config(),
        LengthFieldCodec::default(),
        Silent,
    ));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client_listener = Recording::new();
    let mut config = client_config(port);
    config.heartbeat = Some(fast_heartbeat());
    // no factory: the policy is ignored instead of sending garbage
    let client = Arc::new(TcpClient::new(
        "hb",
        config,
        LengthFieldCodec::default(),
        client_listener.clone(),
        None,
    ));
    client.connect().await.unwrap();

    sleep(Duration::from_millis(400)).await;
    assert_eq!(client_listener.closes(), 0);
    assert!(client.session().unwrap().is_open());

    client.disconnect().await;
    server.shutdown().await;
}
