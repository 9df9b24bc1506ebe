//! Shared state handed to every worker.

use std::sync::Arc;

use crate::monitor::MonitorStore;
use crate::request_queue::RequestQueue;
use crate::shutdown::ShutdownToken;

/// Everything the accept loop, the workers and the supervisors share:
/// the request queue, the monitoring history and the shutdown token.
/// Constructed once at startup; there is no other process-wide state.
#[derive(Debug, Default)]
pub struct OverseerContext {
    pub queue: RequestQueue,
    pub store: MonitorStore,
    pub shutdown: ShutdownToken,
}

impl OverseerContext {
    pub fn new() -> Arc<OverseerContext> {
        Arc::new(OverseerContext::default())
    }
}
