pub use config::{
    BackoffPolicy, ClientConfig, HeartbeatPolicy, ReconnectPolicy, ServConfig, ServerConfig,
};
pub use error::{ServError, ServResult};
pub use serv::Serv;
pub(crate) use serv::{BoxFuture, Endpoint};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod config;
mod error;
mod serv;
mod shutdown;
mod tracing_config;
