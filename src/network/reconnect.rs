use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;

use crate::service::ReconnectPolicy;

/// Reconnect state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStatus {
    Idle,
    /// timer armed, waiting out the backoff delay
    Waiting,
    Connecting,
    /// attempt ceiling reached; no further retries until reset
    GivenUp,
}

/// Tracks reconnect attempts for one client under a backoff policy.
///
/// The owning client drives the retry loop; this service decides whether and
/// how long to wait before the next attempt. The attempt counter resets to
/// zero on every successful connect.
pub struct ReconnectService {
    policy: ReconnectPolicy,
    status: RwLock<ReconnectStatus>,
    attempts: AtomicU32,
}

impl ReconnectService {
    pub fn new(policy: ReconnectPolicy) -> Self {
        ReconnectService {
            policy,
            status: RwLock::new(ReconnectStatus::Idle),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> ReconnectStatus {
        *self.status.read()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Arms the next attempt and returns its delay, or `None` once the
    /// attempt ceiling is reached, moving the machine to `GivenUp`.
    pub(crate) fn next_delay(&self) -> Option<Duration> {
        let attempt = self.attempts.load(Ordering::SeqCst);
        if attempt >= self.policy.max_attempts {
            *self.status.write() = ReconnectStatus::GivenUp;
            return None;
        }
        self.attempts.store(attempt + 1, Ordering::SeqCst);
        *self.status.write() = ReconnectStatus::Waiting;

        let base = self.policy.backoff.base_delay(attempt);
        let delay = if self.policy.backoff.jitter() {
            base + Duration::from_millis(rand::thread_rng().gen_range(0..100))
        } else {
            base
        };
        Some(delay)
    }

    pub(crate) fn mark_connecting(&self) {
        *self.status.write() = ReconnectStatus::Connecting;
    }

    /// Called after a successful connect.
    pub(crate) fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        *self.status.write() = ReconnectStatus::Idle;
    }
}

#[cfg(test)]
mod tests {
    use crate::service::BackoffPolicy;

    use super::*;

    #[test]
    fn test_attempt_ceiling() {
        let service = ReconnectService::new(ReconnectPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy::Fixed { delay_ms: 10 },
        });

        assert!(service.next_delay().is_some());
        assert!(service.next_delay().is_some());
        assert!(service.next_delay().is_some());
        assert_eq!(service.attempts(), 3);

        assert_eq!(service.next_delay(), None);
        assert_eq!(service.status(), ReconnectStatus::GivenUp);
        // stays given up until reset
        assert_eq!(service.next_delay(), None);

        service.reset();
        assert_eq!(service.status(), ReconnectStatus::Idle);
        assert_eq!(service.attempts(), 0);
        assert!(service.next_delay().is_some());
    }

    #[test]
    fn test_delays_non_decreasing() {
        let service = ReconnectService::new(ReconnectPolicy {
            max_attempts: 10,
            backoff: BackoffPolicy::Exponential {
                initial_ms: 50,
                max_ms: 1_000,
                jitter: false,
            },
        });

        let mut last = Duration::ZERO;
        while let Some(delay) = service.next_delay() {
            assert!(delay >= last);
            last = delay;
        }
        assert_eq!(service.attempts(), 10);
    }
}
