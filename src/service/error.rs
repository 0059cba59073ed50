pub type ServResult<T> = Result<T, ServError>;

/// Error taxonomy of the service framework.
///
/// I/O and framing errors are contained at the session boundary: they reach the
/// application through listener callbacks, never by tearing down sibling
/// sessions or the runtime. Registration and startup errors are returned
/// directly to the caller.
#[derive(Debug, thiserror::Error)]
#[error("serv error")]
pub enum ServError {
    /// binding a server socket failed; fatal to the affected server only
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// an outbound connect attempt failed; recoverable via the reconnect
    /// service when one is configured
    #[error("failed to connect {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("encode error: {0}")]
    Codec(String),

    /// framing desync on the inbound byte stream; forces session closure
    #[error("frame error: {0}")]
    Frame(String),

    #[error("duplicate {role} name: {name}")]
    DuplicateName { role: &'static str, name: String },

    #[error("startup failed, all endpoints rolled back: {0:?}")]
    StartupAggregate(Vec<String>),

    #[error("reconnect to {addr} given up after {attempts} attempts")]
    ReconnectExhausted { addr: String, attempts: u32 },

    #[error("session {0} outbound queue full")]
    QueueFull(u64),

    #[error("session {0} is closed")]
    SessionClosed(u64),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// marker error: not enough buffered bytes for a full frame
    Incomplete,
}
