extern crate config as _;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ServError, ServResult};

/// Configuration for one named server endpoint.
///
/// Built once by the host application (or loaded from file) and handed to the
/// registry at registration time; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub read_buffer_size: usize,
    pub outbound_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 0,
            max_connections: 1024,
            read_buffer_size: 4 * 1024,
            outbound_queue_size: 256,
        }
    }
}

impl ServerConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for one named client endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub outbound_queue_size: usize,
    pub reconnect: Option<ReconnectPolicy>,
    pub heartbeat: Option<HeartbeatPolicy>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            connect_timeout_ms: 10_000,
            read_buffer_size: 4 * 1024,
            outbound_queue_size: 256,
            reconnect: None,
            heartbeat: None,
        }
    }
}

impl ClientConfig {
    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Retry policy applied by the reconnect service after an unexpected close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Delay schedule between reconnect attempts.
///
/// Expected delays must be non-decreasing in the attempt index so a flapping
/// peer cannot trigger a connection storm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        jitter: bool,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            initial_ms: 100,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Base delay before attempt number `attempt` (zero-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential {
                initial_ms, max_ms, ..
            } => {
                let shifted = initial_ms.saturating_mul(1u64 << attempt.min(32));
                Duration::from_millis(shifted.min(*max_ms))
            }
        }
    }

    pub fn jitter(&self) -> bool {
        match self {
            BackoffPolicy::Fixed { .. } => false,
            BackoffPolicy::Exponential { jitter, .. } => *jitter,
        }
    }
}

/// Keep-alive policy attached to client sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatPolicy {
    /// send a keep-alive frame after this much write-side idle time
    pub interval_ms: u64,
    /// a receive-side silence window of this length counts as one miss
    pub timeout_ms: u64,
    /// misses beyond this count force-close the session
    pub threshold: u32,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        HeartbeatPolicy {
            interval_ms: 5_000,
            timeout_ms: 15_000,
            threshold: 2,
        }
    }
}

impl HeartbeatPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top level configuration: runtime sizing plus the named endpoint sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServConfig {
    /// worker threads of the reactor runtime
    pub reactor_threads: usize,
    pub servers: HashMap<String, ServerConfig>,
    pub clients: HashMap<String, ClientConfig>,
}

impl Default for ServConfig {
    fn default() -> Self {
        ServConfig {
            reactor_threads: num_cpus::get(),
            servers: HashMap::new(),
            clients: HashMap::new(),
        }
    }
}

impl ServConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> ServResult<ServConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(ServError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let serv_config: ServConfig = config.try_deserialize()?;

        Ok(serv_config)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_default_sections() {
        let config = ServConfig::default();
        assert!(config.reactor_threads >= 1);
        assert!(config.servers.is_empty());
        assert!(config.clients.is_empty());
    }

    #[rstest]
    #[case(0, 100)]
    #[case(1, 200)]
    #[case(2, 400)]
    #[case(8, 25_600)]
    #[case(20, 30_000)]
    fn test_exponential_backoff_caps(#[case] attempt: u32, #[case] expect_ms: u64) {
        let policy = BackoffPolicy::Exponential {
            initial_ms: 100,
            max_ms: 30_000,
            jitter: false,
        };
        assert_eq!(policy.base_delay(attempt), Duration::from_millis(expect_ms));
    }

    #[test]
    fn test_backoff_non_decreasing() {
        let policy = BackoffPolicy::default();
        let mut last = Duration::ZERO;
        for attempt in 0..16 {
            let delay = policy.base_delay(attempt);
            assert!(delay >= last);
            last = delay;
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = BackoffPolicy::Fixed { delay_ms: 250 };
        assert_eq!(policy.base_delay(0), policy.base_delay(7));
        assert!(!policy.jitter());
    }
}
