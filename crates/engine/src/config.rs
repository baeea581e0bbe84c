//! Engine tuning knobs.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Intervals, timeouts and the retry policy shared by the scheduler and the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause between scheduling / retry-promotion passes.
    pub scheduler_interval: Duration,
    /// Pause between retention cleanups.
    pub cleanup_interval: Duration,
    /// How long a terminal run is kept before cleanup deletes it.
    pub retention: Duration,
    /// Dispatcher sleep when the ready queue is empty.
    pub poll_interval: Duration,
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,
    /// A PENDING/RETRY task untouched for this long is re-enqueued.
    pub stale_task_after: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(60),
            stale_task_after: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
        }
    }
}
