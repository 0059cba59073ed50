//! Live connection state.
//!
//! A [`Session`] is one TCP connection or one logical UDP peer. Its I/O is
//! pumped by exactly one task for its whole lifetime, which is what makes the
//! per-session listener ordering guarantee hold. The only structure touched
//! from other threads is the outbound queue, which is a bounded mpsc channel,
//! and the attribute map, which is internally synchronized.

pub use listener::Listener;

mod listener;

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};

use crate::{ServError, ServResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// outbound client awaiting connect completion
    Connecting,
    Open,
    Closing,
    /// terminal
    Closed,
}

/// Why a session ended. Delivered once through `Listener::on_close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// the peer closed the connection gracefully
    PeerClosed,
    /// explicit local `disconnect()` or endpoint `shutdown()`
    Disconnected,
    IoError,
    /// framing or codec failure on the inbound stream
    ProtocolError,
    HeartbeatTimeout,
}

impl CloseReason {
    /// Unexpected closes are eligible for the reconnect service.
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, CloseReason::Disconnected)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::Disconnected => "disconnected",
            CloseReason::IoError => "io error",
            CloseReason::ProtocolError => "protocol error",
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
        };
        f.write_str(text)
    }
}

/// One entry of the outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound<M> {
    Msg(M),
    /// datagram reply to an explicit destination (UDP server side)
    MsgTo(M, SocketAddr),
}

pub struct Session<M> {
    id: u64,
    remote: RwLock<Option<SocketAddr>>,
    state: RwLock<SessionState>,
    attributes: DashMap<String, Box<dyn Any + Send + Sync>>,
    outbound_tx: mpsc::Sender<Outbound<M>>,
    close_requested: AtomicBool,
    close_reason: RwLock<Option<CloseReason>>,
    notify_close: Notify,
    epoch: Instant,
    last_send_ms: AtomicU64,
    last_recv_ms: AtomicU64,
    missed_beats: AtomicU32,
}

impl<M> fmt::Debug for Session<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &*self.remote.read())
            .field("state", &*self.state.read())
            .finish()
    }
}

impl<M: Send + 'static> Session<M> {
    /// Creates the session and hands back the outbound queue receiver for the
    /// owning pump task.
    pub(crate) fn new(
        remote: Option<SocketAddr>,
        state: SessionState,
        outbound_queue_size: usize,
    ) -> (Arc<Session<M>>, mpsc::Receiver<Outbound<M>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_queue_size.max(1));
        let now = Instant::now();
        let session = Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote: RwLock::new(remote),
            state: RwLock::new(state),
            attributes: DashMap::new(),
            outbound_tx,
            close_requested: AtomicBool::new(false),
            close_reason: RwLock::new(None),
            notify_close: Notify::new(),
            epoch: now,
            last_send_ms: AtomicU64::new(0),
            last_recv_ms: AtomicU64::new(0),
            missed_beats: AtomicU32::new(0),
        };
        (Arc::new(session), outbound_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote peer address. For a UDP server session this is the source of
    /// the datagram currently being dispatched.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.read()
    }

    pub(crate) fn set_remote(&self, addr: SocketAddr) {
        *self.remote.write() = Some(addr);
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), SessionState::Open)
    }

    /// Stores a per-connection attribute for application use.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Any + Send + Sync) {
        self.attributes.insert(key.into(), Box::new(value));
    }

    /// Reads back a cloneable attribute previously stored under `key`.
    pub fn attribute<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|entry| entry.value().downcast_ref::<T>().cloned())
    }

    pub fn remove_attribute(&self, key: &str) {
        self.attributes.remove(key);
    }

    /// Enqueues a message for ordered delivery to the peer.
    ///
    /// Safe to call from any thread. Messages are written in enqueue order by
    /// the owning pump task. Fails fast instead of blocking when the bounded
    /// queue is full.
    pub fn send(&self, msg: M) -> ServResult<()> {
        self.enqueue(Outbound::Msg(msg))
    }

    /// Enqueues a datagram reply to an explicit destination. Only meaningful
    /// on UDP server sessions; on stream sessions the destination is ignored.
    pub fn send_to(&self, msg: M, addr: SocketAddr) -> ServResult<()> {
        self.enqueue(Outbound::MsgTo(msg, addr))
    }

    fn enqueue(&self, outbound: Outbound<M>) -> ServResult<()> {
        match self.state() {
            SessionState::Closing | SessionState::Closed => {
                return Err(ServError::SessionClosed(self.id))
            }
            _ => {}
        }
        self.outbound_tx.try_send(outbound).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ServError::QueueFull(self.id),
            mpsc::error::TrySendError::Closed(_) => ServError::SessionClosed(self.id),
        })
    }

    /// Requests closure of the session. Idempotent: only the first call takes
    /// effect, later calls are no-ops.
    pub fn close(&self, reason: CloseReason) {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.close_reason.write() = Some(reason);
        let mut state = self.state.write();
        if !matches!(*state, SessionState::Closed) {
            *state = SessionState::Closing;
        }
        drop(state);
        self.notify_close.notify_one();
    }

    pub(crate) fn requested_close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.read()
    }

    /// Resolved by the pump task when `close` has been requested.
    pub(crate) async fn closed(&self) {
        self.notify_close.notified().await;
    }

    /// Moves the session to its terminal state. Returns true exactly once so
    /// the pump fires `on_close` a single time.
    pub(crate) fn transition_closed(&self) -> bool {
        let mut state = self.state.write();
        if matches!(*state, SessionState::Closed) {
            return false;
        }
        *state = SessionState::Closed;
        true
    }

    pub(crate) fn touch_send(&self) {
        self.last_send_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);
    }

    /// Any inbound traffic counts as liveness, not only heartbeat replies.
    pub(crate) fn touch_recv(&self) {
        self.last_recv_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);
        self.missed_beats.store(0, Ordering::Relaxed);
    }

    pub(crate) fn idle_since_send(&self) -> Duration {
        let last = self.last_send_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    pub(crate) fn idle_since_recv(&self) -> Duration {
        let last = self.last_recv_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    pub(crate) fn record_missed_beat(&self) -> u32 {
        self.missed_beats.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_attribute_map() {
        let (session, _rx) = Session::<Bytes>::new(None, SessionState::Open, 4);
        session.set_attribute("user", "alice".to_string());
        session.set_attribute("hits", 3u32);

        assert_eq!(session.attribute::<String>("user").unwrap(), "alice");
        assert_eq!(session.attribute::<u32>("hits").unwrap(), 3);
        assert_eq!(session.attribute::<u32>("user"), None);

        session.remove_attribute("user");
        assert_eq!(session.attribute::<String>("user"), None);
    }

    #[test]
    fn test_send_after_close_rejected() {
        let (session, _rx) = Session::<Bytes>::new(None, SessionState::Open, 4);
        session.close(CloseReason::Disconnected);
        assert!(matches!(
            session.send(Bytes::from_static(b"late")),
            Err(ServError::SessionClosed(_))
        ));
    }

    #[test]
    fn test_bounded_queue_fails_fast() {
        let (session, _rx) = Session::<Bytes>::new(None, SessionState::Open, 1);
        session.send(Bytes::from_static(b"one")).unwrap();
        assert!(matches!(
            session.send(Bytes::from_static(b"two")),
            Err(ServError::QueueFull(_))
        ));
    }

    #[test]
    fn test_connecting_session_promoted_on_open() {
        let (session, _rx) = Session::<Bytes>::new(None, SessionState::Connecting, 4);
        assert!(!session.is_open());
        // sends enqueued before the promotion are kept, not rejected
        session.send(Bytes::from_static(b"early")).unwrap();

        session.set_state(SessionState::Open);
        assert!(session.is_open());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (session, _rx) = Session::<Bytes>::new(None, SessionState::Open, 4);
        session.close(CloseReason::HeartbeatTimeout);
        session.close(CloseReason::Disconnected);
        // first reason wins
        assert_eq!(
            session.requested_close_reason(),
            Some(CloseReason::HeartbeatTimeout)
        );
        assert!(session.transition_closed());
        assert!(!session.transition_closed());
    }
}
