use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use super::tcp::SessionPump;
use crate::codec::Codec;
use crate::service::{BoxFuture, Endpoint, Shutdown};
use crate::session::{Listener, Session, SessionState};
use crate::{ServError, ServResult, ServerConfig};

/// TCP server endpoint: binds a listening socket and turns every accepted
/// connection into a session pumped by its own task.
pub struct TcpServer<C: Codec, L: Listener<C::Msg>> {
    name: String,
    config: ServerConfig,
    codec: Arc<C>,
    listener: Arc<L>,
    notify_shutdown: broadcast::Sender<()>,
    limit_connections: Arc<Semaphore>,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: Mutex<Option<mpsc::Receiver<()>>>,
    started: AtomicBool,
}

impl<C: Codec, L: Listener<C::Msg>> TcpServer<C, L> {
    pub fn new(name: impl Into<String>, config: ServerConfig, codec: C, listener: L) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        let limit_connections = Arc::new(Semaphore::new(config.max_connections));
        TcpServer {
            name: name.into(),
            config,
            codec: Arc::new(codec),
            listener: Arc::new(listener),
            notify_shutdown,
            limit_connections,
            local_addr: RwLock::new(None),
            shutdown_complete_tx: Mutex::new(None),
            shutdown_complete_rx: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual bound address, available once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Binds the listening socket and starts accepting. A bind failure
    /// surfaces as `ServError::Bind` and leaves the server not started.
    pub async fn start(self: &Arc<Self>) -> ServResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listen_address = self.config.listen_address();
        let tcp_listener = match TcpListener::bind(&listen_address).await {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(ServError::Bind {
                    addr: listen_address,
                    source: e,
                });
            }
        };
        *self.local_addr.write() = tcp_listener.local_addr().ok();
        info!(server = %self.name, addr = %listen_address, "tcp server bound for listening");

        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        *self.shutdown_complete_tx.lock() = Some(shutdown_complete_tx.clone());
        *self.shutdown_complete_rx.lock() = Some(shutdown_complete_rx);

        // subscribe before the task is spawned, a shutdown sent right after
        // start must not be lost
        let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.run(tcp_listener, shutdown, shutdown_complete_tx).await;
        });
        Ok(())
    }

    /// Stops accepting, closes all child sessions and waits for their pump
    /// tasks to drain before releasing the bound socket. Idempotent.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(server = %self.name, "tcp server shutting down");
        let _ = self.notify_shutdown.send(());
        self.shutdown_complete_tx.lock().take();
        let rx = self.shutdown_complete_rx.lock().take();
        if let Some(mut rx) = rx {
            // resolves once the accept loop and every session task dropped
            // their completion senders
            let _ = rx.recv().await;
        }
        *self.local_addr.write() = None;
        info!(server = %self.name, "tcp server shutdown complete");
    }

    async fn run(
        self: Arc<Self>,
        tcp_listener: TcpListener,
        mut shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        loop {
            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => permit.unwrap(),
                _ = shutdown.recv() => {
                    debug!(server = %self.name, "accept loop received shutdown signal");
                    break;
                }
            };

            let socket = tokio::select! {
                res = self.accept(&tcp_listener) => {
                    match res {
                        Ok(socket) => socket,
                        Err(e) => {
                            error!(server = %self.name, cause = %e, "failed to accept");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!(server = %self.name, "accept loop received shutdown signal");
                    break;
                }
            };

            self.spawn_session(socket, permit, shutdown_complete_tx.clone());
        }
        // dropping the listener here releases the bound socket
    }

    async fn accept(&self, tcp_listener: &TcpListener) -> ServResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match tcp_listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(ServError::Io(err));
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }

    fn spawn_session(
        &self,
        socket: TcpStream,
        permit: tokio::sync::OwnedSemaphorePermit,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        let remote = socket.peer_addr().ok();
        // accepted connections start directly in the open state
        let (session, outbound_rx) =
            Session::new(remote, SessionState::Open, self.config.outbound_queue_size);
        debug!(server = %self.name, session_id = session.id(), ?remote, "accepted connection");

        self.listener.on_connect(&session);

        let pump = SessionPump {
            session,
            codec: self.codec.clone(),
            listener: self.listener.clone(),
            outbound_rx,
            shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
            read_buffer_size: self.config.read_buffer_size,
        };
        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            pump.run(socket).await;
            // whether gracefully or unexpectedly closed, release the slot
            drop(permit);
        });
    }
}

impl<C: Codec, L: Listener<C::Msg>> Endpoint for TcpServer<C, L> {
    fn start(self: Arc<Self>) -> BoxFuture<'static, ServResult<()>> {
        Box::pin(async move { TcpServer::start(&self).await })
    }

    fn stop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { TcpServer::shutdown(&self).await })
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
