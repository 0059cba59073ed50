use std::sync::Arc;

use super::{CloseReason, Session};
use crate::ServError;

/// Application callback set, invoked by the session pump.
///
/// Callbacks for a single session are never invoked concurrently with each
/// other; callbacks across different sessions may run in parallel. They run
/// synchronously on the session's own task, so long blocking work must be
/// offloaded to a worker and fed back through `Session::send`.
pub trait Listener<M>: Send + Sync + 'static {
    fn on_connect(&self, _session: &Arc<Session<M>>) {}

    /// One decoded message, in arrival order.
    fn on_receive(&self, session: &Arc<Session<M>>, msg: M);

    /// A contained failure on this session. Framing errors are followed by
    /// exactly one `on_close`.
    fn on_exception(&self, _session: &Arc<Session<M>>, _error: &ServError) {}

    /// Fired exactly once per session lifetime.
    fn on_close(&self, _session: &Arc<Session<M>>, _reason: CloseReason) {}
}
