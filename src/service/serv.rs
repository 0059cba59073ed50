use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{error, info};

use crate::codec::Codec;
use crate::network::{HeartbeatFactory, TcpClient, TcpServer, UdpClient, UdpServer};
use crate::session::Listener;
use crate::{ClientConfig, ServError, ServResult, ServerConfig};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased start/stop surface shared by every server and client, so the
/// registry can hold them in one map per role without an async-trait crate.
pub(crate) trait Endpoint: Send + Sync + 'static {
    fn start(self: Arc<Self>) -> BoxFuture<'static, ServResult<()>>;
    fn stop(self: Arc<Self>) -> BoxFuture<'static, ()>;
    fn is_started(&self) -> bool;
}

/// Process-wide registry of named servers and clients.
///
/// Server and client names are independent namespaces; a duplicate within a
/// namespace is rejected at registration time with no side effects. Owned by
/// the process entry point and passed to whatever needs it, never looked up
/// globally.
#[derive(Default)]
pub struct Serv {
    servers: DashMap<String, Arc<dyn Endpoint>>,
    clients: DashMap<String, Arc<dyn Endpoint>>,
}

impl Serv {
    pub fn new() -> Self {
        Serv::default()
    }

    /// Registers a TCP server. The returned handle stays valid for the
    /// registry's lifetime and is the way to reach the concrete endpoint.
    pub fn register_tcp_server<C, L>(
        &self,
        name: impl Into<String>,
        config: ServerConfig,
        codec: C,
        listener: L,
    ) -> ServResult<Arc<TcpServer<C, L>>>
    where
        C: Codec,
        L: Listener<C::Msg>,
    {
        let name = name.into();
        let server = Arc::new(TcpServer::new(name.clone(), config, codec, listener));
        Self::insert(&self.servers, "server", name, server.clone())?;
        Ok(server)
    }

    pub fn register_udp_server<C, L>(
        &self,
        name: impl Into<String>,
        config: ServerConfig,
        codec: C,
        listener: L,
    ) -> ServResult<Arc<UdpServer<C, L>>>
    where
        C: Codec,
        L: Listener<C::Msg>,
    {
        let name = name.into();
        let server = Arc::new(UdpServer::new(name.clone(), config, codec, listener));
        Self::insert(&self.servers, "server", name, server.clone())?;
        Ok(server)
    }

    /// Registers a TCP client. Reconnect engages when the config carries a
    /// policy; heartbeat additionally needs a factory for the keep-alive
    /// frame.
    pub fn register_tcp_client<C, L>(
        &self,
        name: impl Into<String>,
        config: ClientConfig,
        codec: C,
        listener: L,
        heartbeat_factory: Option<Arc<dyn HeartbeatFactory<C::Msg>>>,
    ) -> ServResult<Arc<TcpClient<C, L>>>
    where
        C: Codec,
        L: Listener<C::Msg>,
    {
        let name = name.into();
        let client = Arc::new(TcpClient::new(
            name.clone(),
            config,
            codec,
            listener,
            heartbeat_factory,
        ));
        Self::insert(&self.clients, "client", name, client.clone())?;
        Ok(client)
    }

    pub fn register_udp_client<C, L>(
        &self,
        name: impl Into<String>,
        config: ClientConfig,
        codec: C,
        listener: L,
        heartbeat_factory: Option<Arc<dyn HeartbeatFactory<C::Msg>>>,
    ) -> ServResult<Arc<UdpClient<C, L>>>
    where
        C: Codec,
        L: Listener<C::Msg>,
    {
        let name = name.into();
        let client = Arc::new(UdpClient::new(
            name.clone(),
            config,
            codec,
            listener,
            heartbeat_factory,
        ));
        Self::insert(&self.clients, "client", name, client.clone())?;
        Ok(client)
    }

    pub fn contains_server(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub fn contains_client(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    /// Starts every registered server, then every registered client.
    ///
    /// All-or-nothing: on the first failure everything started by this call
    /// is stopped again and the aggregated error is returned, so a partial
    /// startup never lingers. Endpoints registered after a successful startup
    /// stay dormant until the next call; already-started endpoints are
    /// skipped, which makes the operation idempotent.
    pub async fn startup(&self) -> ServResult<()> {
        let mut endpoints: Vec<(String, Arc<dyn Endpoint>)> = Vec::new();
        for entry in self.servers.iter() {
            endpoints.push((entry.key().clone(), entry.value().clone()));
        }
        for entry in self.clients.iter() {
            endpoints.push((entry.key().clone(), entry.value().clone()));
        }

        let mut started: Vec<(String, Arc<dyn Endpoint>)> = Vec::new();
        for (name, endpoint) in endpoints {
            if endpoint.is_started() {
                continue;
            }
            match endpoint.clone().start().await {
                Ok(()) => {
                    info!(endpoint = %name, "endpoint started");
                    started.push((name, endpoint));
                }
                Err(e) => {
                    error!(endpoint = %name, cause = %e, "endpoint failed to start, rolling back");
                    let failure = format!("{}: {}", name, e);
                    for (rolled_name, rolled) in started.into_iter().rev() {
                        rolled.stop().await;
                        info!(endpoint = %rolled_name, "endpoint rolled back");
                    }
                    return Err(ServError::StartupAggregate(vec![failure]));
                }
            }
        }
        Ok(())
    }

    /// Stops every client, then every server. Idempotent: endpoints that are
    /// not running are left alone.
    pub async fn shutdown(&self) {
        let mut endpoints: Vec<Arc<dyn Endpoint>> = Vec::new();
        for entry in self.clients.iter() {
            endpoints.push(entry.value().clone());
        }
        for entry in self.servers.iter() {
            endpoints.push(entry.value().clone());
        }
        for endpoint in endpoints {
            endpoint.stop().await;
        }
        info!("registry shutdown complete");
    }

    fn insert(
        map: &DashMap<String, Arc<dyn Endpoint>>,
        role: &'static str,
        name: String,
        endpoint: Arc<dyn Endpoint>,
    ) -> ServResult<()> {
        match map.entry(name) {
            Entry::Occupied(occupied) => Err(ServError::DuplicateName {
                role,
                name: occupied.key().clone(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(endpoint);
                Ok(())
            }
        }
    }
}
