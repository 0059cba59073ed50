//! Endpoint implementations.
//!
//! Built on tokio's async I/O primitives: the runtime's worker threads are
//! the reactor, and every session is pumped by exactly one spawned task for
//! its lifetime. A slow listener callback therefore stalls only the sessions
//! multiplexed onto that worker, never the whole system.

pub use heartbeat::{HeartbeatFactory, HeartbeatService};
pub use reconnect::{ReconnectService, ReconnectStatus};
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
pub use udp_client::UdpClient;
pub use udp_server::UdpServer;

mod heartbeat;
mod reconnect;
mod tcp;
mod tcp_client;
mod tcp_server;
mod udp_client;
mod udp_server;

#[cfg(test)]
mod tests;
