use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::heartbeat::{HeartbeatFactory, HeartbeatService};
use super::reconnect::ReconnectService;
use super::tcp::finish;
use crate::codec::Codec;
use crate::service::{BoxFuture, Endpoint, Shutdown};
use crate::session::{CloseReason, Listener, Outbound, Session, SessionState};
use crate::{ClientConfig, ServError, ServResult};

/// UDP client endpoint: a datagram socket connected to one remote peer, with
/// the same reconnect and heartbeat services as the TCP client. Heartbeat is
/// the main liveness signal here, since a datagram peer going away is
/// otherwise silent.
pub struct UdpClient<C: Codec, L: Listener<C::Msg>> {
    name: String,
    config: ClientConfig,
    codec: Arc<C>,
    listener: Arc<L>,
    reconnect: Option<Arc<ReconnectService>>,
    heartbeat: Option<HeartbeatService<C::Msg>>,
    notify_shutdown: broadcast::Sender<()>,
    session: RwLock<Option<Arc<Session<C::Msg>>>>,
    explicit_close: AtomicBool,
    started: AtomicBool,
}

impl<C: Codec, L: Listener<C::Msg>> UdpClient<C, L> {
    pub fn new(
        name: impl Into<String>,
        config: ClientConfig,
        codec: C,
        listener: L,
        heartbeat_factory: Option<Arc<dyn HeartbeatFactory<C::Msg>>>,
    ) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        let reconnect = config
            .reconnect
            .clone()
            .map(|policy| Arc::new(ReconnectService::new(policy)));
        let heartbeat = match (&config.heartbeat, heartbeat_factory) {
            (Some(policy), Some(factory)) => {
                Some(HeartbeatService::from_shared(policy.clone(), factory))
            }
            (Some(_), None) => {
                warn!("heartbeat policy configured without a frame factory, heartbeat disabled");
                None
            }
            _ => None,
        };
        UdpClient {
            name: name.into(),
            config,
            codec: Arc::new(codec),
            listener: Arc::new(listener),
            reconnect,
            heartbeat,
            notify_shutdown,
            session: RwLock::new(None),
            explicit_close: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> Option<Arc<Session<C::Msg>>> {
        self.session.read().clone()
    }

    pub async fn connect(self: &Arc<Self>) -> ServResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.explicit_close.store(false, Ordering::SeqCst);

        match self.connect_once().await {
            Ok(()) => Ok(()),
            Err(e) => match &self.reconnect {
                Some(reconnect) => {
                    warn!(client = %self.name, cause = %e, "initial connect failed, reconnect service engaged");
                    // the failed initial connect counts as the first attempt
                    let _ = reconnect.next_delay();
                    let client = Arc::clone(self);
                    tokio::spawn(async move { client.reconnect_loop().await });
                    Ok(())
                }
                None => {
                    self.started.store(false, Ordering::SeqCst);
                    Err(e)
                }
            },
        }
    }

    pub async fn disconnect(&self) {
        self.explicit_close.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        let session = self.session.write().take();
        if let Some(session) = session {
            debug!(client = %self.name, session_id = session.id(), "explicit disconnect");
            session.close(CloseReason::Disconnected);
        }
        let _ = self.notify_shutdown.send(());
    }

    async fn connect_once(self: &Arc<Self>) -> ServResult<()> {
        let addr = self.config.remote_address();
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ServError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        socket.connect(&addr).await.map_err(|e| ServError::Connect {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        let remote = socket.peer_addr().ok();
        let (session, outbound_rx) = Session::new(
            remote,
            SessionState::Connecting,
            self.config.outbound_queue_size,
        );
        info!(client = %self.name, session_id = session.id(), %addr, "udp client connected");
        *self.session.write() = Some(session.clone());

        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.attach(session.clone());
        }
        session.set_state(SessionState::Open);
        self.listener.on_connect(&session);

        // subscribe before the task is spawned, a shutdown sent right after
        // connect must not be lost
        let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let reason = client.run(socket, session, outbound_rx, shutdown).await;
            client.on_session_end(reason);
        });
        Ok(())
    }

    async fn run(
        &self,
        socket: UdpSocket,
        session: Arc<Session<C::Msg>>,
        mut outbound_rx: mpsc::Receiver<Outbound<C::Msg>>,
        mut shutdown: Shutdown,
    ) -> CloseReason {
        let mut buf = BytesMut::new();
        let mut encode_buf = BytesMut::new();

        let reason = loop {
            buf.reserve(self.config.read_buffer_size.max(2048));
            tokio::select! {
                received = socket.recv_buf(&mut buf) => {
                    match received {
                        Ok(_) => {
                            session.touch_recv();
                            let mut datagram = buf.split();
                            match self.codec.decode(&mut datagram) {
                                Ok(Some(msg)) => self.listener.on_receive(&session, msg),
                                Ok(None) => {
                                    let err = ServError::Frame(
                                        "datagram did not contain a complete frame".to_string(),
                                    );
                                    self.listener.on_exception(&session, &err);
                                }
                                Err(e) => self.listener.on_exception(&session, &e),
                            }
                        }
                        Err(e) => {
                            // ICMP unreachable surfaces here on connected
                            // sockets; report it and let heartbeat decide
                            warn!(client = %self.name, cause = %e, "udp receive error");
                            self.listener.on_exception(&session, &e.into());
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    let Some(outbound) = outbound else {
                        break CloseReason::Disconnected;
                    };
                    let msg = match &outbound {
                        Outbound::Msg(msg) => msg,
                        // destination fixed by the connected socket
                        Outbound::MsgTo(msg, _) => msg,
                    };
                    encode_buf.clear();
                    match self.codec.encode(msg, &mut encode_buf) {
                        Ok(()) => match socket.send(&encode_buf).await {
                            Ok(_) => session.touch_send(),
                            Err(e) => self.listener.on_exception(&session, &e.into()),
                        },
                        Err(e) => self.listener.on_exception(&session, &e),
                    }
                }
                _ = session.closed() => {
                    break session
                        .requested_close_reason()
                        .unwrap_or(CloseReason::Disconnected);
                }
                _ = shutdown.recv() => {
                    debug!(client = %self.name, "udp pump received shutdown signal");
                    break CloseReason::Disconnected;
                }
            }
        };

        finish(&session, &*self.listener, reason);
        reason
    }

    fn on_session_end(self: &Arc<Self>, reason: CloseReason) {
        let explicit = self.explicit_close.load(Ordering::SeqCst);
        if explicit || !reason.is_unexpected() {
            self.started.store(false, Ordering::SeqCst);
            return;
        }
        match &self.reconnect {
            Some(_) => {
                info!(client = %self.name, %reason, "unexpected close, reconnect service engaged");
                let client = Arc::clone(self);
                tokio::spawn(async move { client.reconnect_loop().await });
            }
            None => {
                self.started.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let reconnect = match &self.reconnect {
            Some(reconnect) => reconnect.clone(),
            None => return,
        };
        loop {
            let Some(delay) = reconnect.next_delay() else {
                let err = ServError::ReconnectExhausted {
                    addr: self.config.remote_address(),
                    attempts: reconnect.max_attempts(),
                };
                error!(client = %self.name, %err, "giving up");
                self.started.store(false, Ordering::SeqCst);
                let session = self
                    .session
                    .read()
                    .clone()
                    .unwrap_or_else(|| Session::new(None, SessionState::Closed, 1).0);
                self.listener.on_exception(&session, &err);
                break;
            };
            sleep(delay).await;
            if self.explicit_close.load(Ordering::SeqCst) {
                break;
            }
            reconnect.mark_connecting();
            match self.connect_once().await {
                Ok(()) => {
                    reconnect.reset();
                    break;
                }
                Err(e) => {
                    warn!(
                        client = %self.name,
                        attempt = reconnect.attempts(),
                        cause = %e,
                        "reconnect attempt failed"
                    );
                }
            }
        }
    }
}

impl<C: Codec, L: Listener<C::Msg>> Endpoint for UdpClient<C, L> {
    fn start(self: Arc<Self>) -> BoxFuture<'static, ServResult<()>> {
        Box::pin(async move { UdpClient::connect(&self).await })
    }

    fn stop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { UdpClient::disconnect(&self).await })
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
