//! Socket-level tests against real loopback endpoints.

mod heartbeat_test;
mod reconnect_test;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use crate::session::{CloseReason, Listener, Session};
use crate::{ClientConfig, ServError, ServerConfig};

/// Callback recorder shared between the test body and the endpoint under
/// test. Built with `echoing` it sends every inbound frame straight back,
/// which is all an echo server needs.
struct Recording {
    echo: bool,
    connects: AtomicU32,
    exceptions: AtomicU32,
    give_ups: AtomicU32,
    closes: AtomicU32,
    received: Mutex<Vec<Bytes>>,
    close_reasons: Mutex<Vec<CloseReason>>,
}

impl Recording {
    fn new() -> Arc<Self> {
        Recording::with_echo(false)
    }

    fn echoing() -> Arc<Self> {
        Recording::with_echo(true)
    }

    fn with_echo(echo: bool) -> Arc<Self> {
        Arc::new(Recording {
            echo,
            connects: AtomicU32::new(0),
            exceptions: AtomicU32::new(0),
            give_ups: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
            close_reasons: Mutex::new(Vec::new()),
        })
    }

    fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    fn exceptions(&self) -> u32 {
        self.exceptions.load(Ordering::SeqCst)
    }

    fn give_ups(&self) -> u32 {
        self.give_ups.load(Ordering::SeqCst)
    }

    fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Listener<Bytes> for Arc<Recording> {
    fn on_connect(&self, _session: &Arc<Session<Bytes>>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_receive(&self, session: &Arc<Session<Bytes>>, msg: Bytes) {
        if self.echo {
            let _ = session.send(msg.clone());
        }
        self.received.lock().push(msg);
    }

    fn on_exception(&self, _session: &Arc<Session<Bytes>>, error: &ServError) {
        if matches!(error, ServError::ReconnectExhausted { .. }) {
            self.give_ups.fetch_add(1, Ordering::SeqCst);
        }
        self.exceptions.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, _session: &Arc<Session<Bytes>>, reason: CloseReason) {
        self.close_reasons.lock().push(reason);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn server_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        outbound_queue_size: 2048,
        ..ServerConfig::default()
    }
}

fn client_config(port: u16) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        outbound_queue_size: 2048,
        ..ClientConfig::default()
    }
}

/// One length-prefixed frame as raw wire bytes.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = (payload.len() as i32).to_be_bytes().to_vec();
    framed.extend_from_slice(payload);
    framed
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
