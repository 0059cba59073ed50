use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::heartbeat::{HeartbeatFactory, HeartbeatService};
use super::reconnect::ReconnectService;
use super::tcp::SessionPump;
use crate::codec::Codec;
use crate::service::{BoxFuture, Endpoint, Shutdown};
use crate::session::{CloseReason, Listener, Session, SessionState};
use crate::{ClientConfig, ServError, ServResult};

/// TCP client endpoint: initiates one outbound connection and keeps it alive
/// through the reconnect and heartbeat services configured for it.
pub struct TcpClient<C: Codec, L: Listener<C::Msg>> {
    name: String,
    config: ClientConfig,
    codec: Arc<C>,
    listener: Arc<L>,
    reconnect: Option<Arc<ReconnectService>>,
    heartbeat: Option<HeartbeatService<C::Msg>>,
    notify_shutdown: broadcast::Sender<()>,
    session: RwLock<Option<Arc<Session<C::Msg>>>>,
    /// set by `disconnect` so the close is not treated as unexpected
    explicit_close: AtomicBool,
    started: AtomicBool,
}

impl<C: Codec, L: Listener<C::Msg>> TcpClient<C, L> {
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
        TcpClient {
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

    /// Most recent session. Stays readable (in its closed state) after an
    /// unexpected close so failures still have a carrier session.
    pub fn session(&self) -> Option<Arc<Session<C::Msg>>> {
        self.session.read().clone()
    }

    pub fn reconnect_service(&self) -> Option<&Arc<ReconnectService>> {
        self.reconnect.as_ref()
    }

    /// Establishes the connection. When a reconnect service is configured an
    /// initial failure is handed to it and `connect` returns `Ok`, with the
    /// retries running in the background; otherwise the failure is returned.
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

    /// Marks the close as explicit and tears the session down. Calling it on
    /// an already-closed client is a no-op; the session still fires
    /// `on_close` exactly once.
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
        let stream = timeout(self.config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| ServError::Connect {
                addr: addr.clone(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| ServError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let remote = stream.peer_addr().ok();
        let (session, outbound_rx) = Session::new(
            remote,
            SessionState::Connecting,
            self.config.outbound_queue_size,
        );
        info!(client = %self.name, session_id = session.id(), %addr, "connected");
        *self.session.write() = Some(session.clone());

        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.attach(session.clone());
        }
        session.set_state(SessionState::Open);
        self.listener.on_connect(&session);

        let pump = SessionPump {
            session,
            codec: self.codec.clone(),
            listener: self.listener.clone(),
            outbound_rx,
            shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
            read_buffer_size: self.config.read_buffer_size,
        };
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let reason = pump.run(stream).await;
            client.on_session_end(reason);
        });
        Ok(())
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
                // terminal event, reported once; reuse the last session as
                // carrier, or a detached closed one if none ever existed
                let session = self.session.read().clone().unwrap_or_else(|| {
                    Session::new(None, SessionState::Closed, 1).0
                });
                self.listener.on_exception(&session, &err);
                break;
            };
            debug!(
                client = %self.name,
                attempt = reconnect.attempts(),
                ?delay,
                "reconnect attempt armed"
            );
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

impl<C: Codec, L: Listener<C::Msg>> Endpoint for TcpClient<C, L> {
    fn start(self: Arc<Self>) -> BoxFuture<'static, ServResult<()>> {
        Box::pin(async move { TcpClient::connect(&self).await })
    }

    fn stop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { TcpClient::disconnect(&self).await })
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
