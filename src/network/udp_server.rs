use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::tcp::finish;
use crate::codec::Codec;
use crate::service::{BoxFuture, Endpoint, Shutdown};
use crate::session::{CloseReason, Listener, Outbound, Session, SessionState};
use crate::{ServError, ServResult, ServerConfig};

/// UDP server endpoint.
///
/// There is no per-peer connection: the bound socket is one session whose
/// remote address is the source of the datagram currently being dispatched.
/// Replies go out with `Session::send` (to that source) or `Session::send_to`
/// (to an explicit destination).
pub struct UdpServer<C: Codec, L: Listener<C::Msg>> {
    name: String,
    config: ServerConfig,
    codec: Arc<C>,
    listener: Arc<L>,
    notify_shutdown: broadcast::Sender<()>,
    local_addr: RwLock<Option<SocketAddr>>,
    session: RwLock<Option<Arc<Session<C::Msg>>>>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: Mutex<Option<mpsc::Receiver<()>>>,
    started: AtomicBool,
}

impl<C: Codec, L: Listener<C::Msg>> UdpServer<C, L> {
    pub fn new(name: impl Into<String>, config: ServerConfig, codec: C, listener: L) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        UdpServer {
            name: name.into(),
            config,
            codec: Arc::new(codec),
            listener: Arc::new(listener),
            notify_shutdown,
            local_addr: RwLock::new(None),
            session: RwLock::new(None),
            shutdown_complete_tx: Mutex::new(None),
            shutdown_complete_rx: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// The socket session, once started.
    pub fn session(&self) -> Option<Arc<Session<C::Msg>>> {
        self.session.read().clone()
    }

    pub async fn start(self: &Arc<Self>) -> ServResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listen_address = self.config.listen_address();
        let socket = match UdpSocket::bind(&listen_address).await {
            Ok(socket) => socket,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(ServError::Bind {
                    addr: listen_address,
                    source: e,
                });
            }
        };
        *self.local_addr.write() = socket.local_addr().ok();
        info!(server = %self.name, addr = %listen_address, "udp server bound");

        let (session, outbound_rx) =
            Session::new(None, SessionState::Open, self.config.outbound_queue_size);
        *self.session.write() = Some(session.clone());
        self.listener.on_connect(&session);

        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        *self.shutdown_complete_tx.lock() = Some(shutdown_complete_tx.clone());
        *self.shutdown_complete_rx.lock() = Some(shutdown_complete_rx);

        // subscribe before the task is spawned, a shutdown sent right after
        // start must not be lost
        let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            server.run(socket, session, outbound_rx, shutdown).await;
        });
        Ok(())
    }

    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(server = %self.name, "udp server shutting down");
        let _ = self.notify_shutdown.send(());
        if let Some(session) = self.session.write().take() {
            session.close(CloseReason::Disconnected);
        }
        self.shutdown_complete_tx.lock().take();
        let rx = self.shutdown_complete_rx.lock().take();
        if let Some(mut rx) = rx {
            let _ = rx.recv().await;
        }
        *self.local_addr.write() = None;
        info!(server = %self.name, "udp server shutdown complete");
    }

    async fn run(
        self: Arc<Self>,
        socket: UdpSocket,
        session: Arc<Session<C::Msg>>,
        mut outbound_rx: mpsc::Receiver<Outbound<C::Msg>>,
        mut shutdown: Shutdown,
    ) {
        let mut buf = BytesMut::new();
        let mut encode_buf = BytesMut::new();

        let reason = loop {
            buf.reserve(self.config.read_buffer_size.max(2048));
            tokio::select! {
                received = socket.recv_buf_from(&mut buf) => {
                    match received {
                        Ok((_, peer)) => {
                            session.touch_recv();
                            session.set_remote(peer);
                            // each datagram is one self-contained frame
                            let mut datagram = buf.split();
                            match self.codec.decode(&mut datagram) {
                                Ok(Some(msg)) => self.listener.on_receive(&session, msg),
                                Ok(None) => {
                                    let err = ServError::Frame(format!(
                                        "datagram from {} did not contain a complete frame",
                                        peer
                                    ));
                                    self.listener.on_exception(&session, &err);
                                }
                                // a bad datagram cannot desync the socket,
                                // report it and keep serving
                                Err(e) => self.listener.on_exception(&session, &e),
                            }
                        }
                        Err(e) => {
                            warn!(server = %self.name, cause = %e, "udp receive error");
                            self.listener.on_exception(&session, &e.into());
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    let Some(outbound) = outbound else {
                        break CloseReason::Disconnected;
                    };
                    self.write_datagram(&socket, &session, &mut encode_buf, outbound).await;
                }
                _ = session.closed() => {
                    break session
                        .requested_close_reason()
                        .unwrap_or(CloseReason::Disconnected);
                }
                _ = shutdown.recv() => {
                    debug!(server = %self.name, "udp pump received shutdown signal");
                    break CloseReason::Disconnected;
                }
            }
        };

        finish(&session, &*self.listener, reason);
    }

    async fn write_datagram(
        &self,
        socket: &UdpSocket,
        session: &Arc<Session<C::Msg>>,
        encode_buf: &mut BytesMut,
        outbound: Outbound<C::Msg>,
    ) {
        let (msg, target) = match &outbound {
            Outbound::Msg(msg) => (msg, session.remote_addr()),
            Outbound::MsgTo(msg, addr) => (msg, Some(*addr)),
        };
        let Some(target) = target else {
            let err = ServError::IllegalState("no destination for outbound datagram".to_string());
            self.listener.on_exception(session, &err);
            return;
        };
        encode_buf.clear();
        if let Err(e) = self.codec.encode(msg, encode_buf) {
            self.listener.on_exception(session, &e);
            return;
        }
        match socket.send_to(encode_buf, target).await {
            Ok(_) => session.touch_send(),
            Err(e) => self.listener.on_exception(session, &e.into()),
        }
    }
}

impl<C: Codec, L: Listener<C::Msg>> Endpoint for UdpServer<C, L> {
    fn start(self: Arc<Self>) -> BoxFuture<'static, ServResult<()>> {
        Box::pin(async move { UdpServer::start(&self).await })
    }

    fn stop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { UdpServer::shutdown(&self).await })
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
