use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::sleep;

use super::{client_config, server_config, wait_until, Recording};
use crate::codec::LengthFieldCodec;
use crate::network::{ReconnectStatus, TcpClient, TcpServer};
use crate::service::{BackoffPolicy, ReconnectPolicy};
use crate::ServerConfig;

fn fixed_reconnect(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        backoff: BackoffPolicy::Fixed { delay_ms: 20 },
    }
}

#[tokio::test]
async fn test_gives_up_after_attempt_ceiling() {
    // grab a port and release it again so connects are refused
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    let client_listener = Recording::new();
    let mut config = client_config(port);
    config.connect_timeout_ms = 1_000;
    config.reconnect = Some(fixed_reconnect(3));
    let client = Arc::new(TcpClient::new(
        "giveup",
        config,
        LengthFieldCodec::default(),
        client_listener.clone(),
        None,
    ));

    // the initial failure engages the reconnect service instead of erroring
    client.connect().await.unwrap();
    wait_until("terminal give-up event", || client_listener.give_ups() == 1).await;

    let reconnect = client.reconnect_service().unwrap();
    assert_eq!(reconnect.status(), ReconnectStatus::GivenUp);
    assert_eq!(reconnect.attempts(), 3);
    assert_eq!(client_listener.connects(), 0);

    // the event fires exactly once
    sleep(Duration::from_millis(200)).await;
    assert_eq!(client_listener.give_ups(), 1);
}

#[tokio::test]
async fn test_reconnects_after_server_restart() {
    let server_listener = Recording::echoing();
    let server = Arc::new(TcpServer::new(
        "restarting",
        server_config(),
        LengthFieldCodec::default(),
        server_listener.clone(),
    ));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client_listener = Recording::new();
    let mut config = client_config(port);
    config.reconnect = Some(fixed_reconnect(20));
    let client = Arc::new(TcpClient::new(
        "comeback",
        config,
        LengthFieldCodec::default(),
        client_listener.clone(),
        None,
    ));
    client.connect().await.unwrap();
    wait_until("first connect", || client_listener.connects() == 1).await;

    // the server going away is an unexpected close, so retries kick in
    server.shutdown().await;
    wait_until("unexpected close observed", || client_listener.closes() == 1).await;

    let replacement = Arc::new(TcpServer::new(
        "restarting",
        ServerConfig {
            port,
            ..server_config()
        },
        LengthFieldCodec::default(),
        Recording::echoing(),
    ));
    replacement.start().await.unwrap();

    wait_until("reconnected", || client_listener.connects() == 2).await;
    let reconnect = client.reconnect_service().unwrap();
    assert_eq!(reconnect.status(), ReconnectStatus::Idle);
    assert_eq!(reconnect.attempts(), 0);

    client.disconnect().await;
    replacement.shutdown().await;
}

#[tokio::test]
async fn test_connect_without_reconnect_fails_fast() {
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    let client_listener = Recording::new();
    let client = Arc::new(TcpClient::new(
        "oneshot",
        client_config(port),
        LengthFieldCodec::default(),
        client_listener.clone(),
        None,
    ));
    assert!(client.connect().await.is_err());
    assert_eq!(client_listener.connects(), 0);

    // the failed connect left the client stopped, a later retry is allowed
    assert!(client.connect().await.is_err());
}
