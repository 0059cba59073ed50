mod codec;
mod network;
mod service;
mod session;

pub use codec::{Codec, LengthFieldCodec, TextLineCodec};
pub use network::{
    HeartbeatFactory, HeartbeatService, ReconnectService, ReconnectStatus, TcpClient, TcpServer,
    UdpClient, UdpServer,
};
pub use service::{
    setup_local_tracing, setup_tracing, BackoffPolicy, ClientConfig, HeartbeatPolicy,
    ReconnectPolicy, Serv, ServConfig, ServError, ServResult, ServerConfig, Shutdown,
};
pub use session::{CloseReason, Listener, Session, SessionState};
