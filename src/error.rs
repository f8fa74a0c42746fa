use std::sync::Arc;
use std::time::Duration;

/// Invalid subscription settings. Always fatal: raised while building settings, before anything
/// starts running, and never corrected behind the caller's back.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Subscription group name cannot be empty")]
    EmptyName,
    #[error("Subscription group '{group}' has no queues to read from")]
    NoQueues { group: String },
    #[error("Subscription group '{group}': prefetch {prefetch} is above the provider limit of {max}")]
    PrefetchOutOfRange { group: String, prefetch: usize, max: usize },
    #[error("Subscription group '{group}': receive wait time {wait:?} is above the provider limit of {max:?}")]
    WaitTimeOutOfRange { group: String, wait: Duration, max: Duration },
    #[error("Subscription group '{group}': {field} must be at least 1")]
    ZeroCapacity { group: String, field: &'static str },
}

/// A failure reported by a queue adapter. These are transient: the receive loop logs them, reports
/// them to the monitor and tries again on its next iteration.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue provider error: {0}")]
    Provider(String),
    #[error("Receive call did not complete within {0:?}")]
    Timeout(Duration),
    #[error("No in-flight message matches receipt handle '{0}'")]
    ReceiptNotFound(String),
}

/// An error surfaced by a [`Dispatcher`]. The pipeline does not look inside it.
///
/// [`Dispatcher`]: crate::Dispatcher
#[derive(Debug)]
pub struct DispatchError(Box<dyn std::error::Error + Send + Sync>);

impl DispatchError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + 'static) = &*self.0;
        Some(inner)
    }
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum MultiplexerError {
    #[error("Multiplexer messages were requested before it was started")]
    NotStarted,
    #[error("Multiplexer output has already completed and cannot be read again")]
    Completed,
}

/// Reason a completion handle faulted. Cancellation is not one of them: a pipeline shut down
/// through its cancellation token completes with `Ok(())`.
#[derive(thiserror::Error, Clone, Debug)]
pub enum RunError {
    #[error("Consumer {consumer} failed to dispatch message {message_id}: {source}")]
    Dispatch { consumer: usize, message_id: String, source: Arc<DispatchError> },
    #[error(transparent)]
    Multiplexer(#[from] MultiplexerError),
    #[error("{0} can only be run once")]
    AlreadyStarted(String),
    #[error("Task {0} panicked")]
    Panicked(String),
    #[error("Task {0} was aborted")]
    Aborted(String),
}
