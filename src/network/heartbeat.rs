use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::service::HeartbeatPolicy;
use crate::session::{CloseReason, Session, SessionState};

/// Supplies the keep-alive frame sent on an idle session.
pub trait HeartbeatFactory<M>: Send + Sync + 'static {
    fn heartbeat(&self) -> M;
}

impl<M, F> HeartbeatFactory<M> for F
where
    F: Fn() -> M + Send + Sync + 'static,
    M: Send + 'static,
{
    fn heartbeat(&self) -> M {
        self()
    }
}

/// Periodic keep-alive and dead-peer detection for one session at a time.
///
/// Runs on its own timer task, outside the session pump. Each tick it sends a
/// heartbeat frame if the write side has been idle for `interval`, and counts
/// one miss for every tick the receive side has been silent longer than
/// `timeout`. Misses beyond `threshold` force-close the session; the close is
/// treated as unexpected, so the reconnect service picks it up. Any inbound
/// traffic zeroes the missed count (tracked by the session pump), not only
/// heartbeat replies.
pub struct HeartbeatService<M> {
    policy: HeartbeatPolicy,
    factory: Arc<dyn HeartbeatFactory<M>>,
}

impl<M> Clone for HeartbeatService<M> {
    fn clone(&self) -> Self {
        HeartbeatService {
            policy: self.policy.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<M: Send + 'static> HeartbeatService<M> {
    pub fn new(policy: HeartbeatPolicy, factory: impl HeartbeatFactory<M>) -> Self {
        Self::from_shared(policy, Arc::new(factory))
    }

    pub fn from_shared(policy: HeartbeatPolicy, factory: Arc<dyn HeartbeatFactory<M>>) -> Self {
        HeartbeatService { policy, factory }
    }

    /// Spawns the timer task for `session`. The task ends on its own when the
    /// session leaves the open state.
    pub(crate) fn attach(&self, session: Arc<Session<M>>) {
        let policy = self.policy.clone();
        let factory = self.factory.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(policy.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match session.state() {
                    SessionState::Closing | SessionState::Closed => break,
                    _ => {}
                }

                if session.idle_since_send() >= policy.interval() {
                    if session.send(factory.heartbeat()).is_err() {
                        break;
                    }
                    debug!(session_id = session.id(), "heartbeat frame enqueued");
                }

                if session.idle_since_recv() >= policy.timeout() {
                    let missed = session.record_missed_beat();
                    if missed > policy.threshold {
                        warn!(
                            session_id = session.id(),
                            missed, "peer judged dead, force closing session"
                        );
                        session.close(CloseReason::HeartbeatTimeout);
                        break;
                    }
                }
            }
            debug!(session_id = session.id(), "heartbeat task exited");
        });
    }
}
