use std::time::Duration;

use crate::error::QueueError;

/// Observes the intake side of the pipeline. Callbacks are purely informational: nothing they do
/// can influence control flow, and they are called inline so they should return quickly.
pub trait Monitor: Send + Sync + 'static {
    /// A fetch against `queue` returned `count` messages after `elapsed`.
    fn receive_time(&self, _queue: &str, _elapsed: Duration, _count: usize) {}

    /// A receive buffer for `queue` spent `elapsed` waiting for room in its channel.
    fn throttle_time(&self, _queue: &str, _elapsed: Duration) {}

    /// A fetch against `queue` failed and will be retried.
    fn receive_error(&self, _queue: &str, _error: &QueueError) {}
}

/// Discards every observation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMonitor;

impl Monitor for NullMonitor {}

/// Turns observations into `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn receive_time(&self, queue: &str, elapsed: Duration, count: usize) {
        tracing::trace!(queue, ?elapsed, count, "Received messages");
    }

    fn throttle_time(&self, queue: &str, elapsed: Duration) {
        tracing::debug!(queue, ?elapsed, "Receive buffer throttled by downstream");
    }

    fn receive_error(&self, queue: &str, error: &QueueError) {
        tracing::warn!(queue, %error, "Failed to receive messages");
    }
}
