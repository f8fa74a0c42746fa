use std::sync::Arc;

use crate::error::QueueError;
use crate::message::{Message, QueueAdapter, ReceiveRequest};

/// A step wrapped around every fetch a receive buffer makes.
///
/// Middlewares run in the order they were registered. Each one decides whether, and with which
/// request, to continue down the chain by calling [`Next::run`]; the last step is the queue
/// adapter itself.
#[async_trait::async_trait]
pub trait ReceiveMiddleware: Send + Sync + 'static {
    async fn handle(&self, request: ReceiveRequest, next: Next<'_>) -> Result<Vec<Message>, QueueError>;
}

/// The remainder of a receive middleware chain.
pub struct Next<'a> {
    queue: &'a dyn QueueAdapter,
    chain: &'a [Arc<dyn ReceiveMiddleware>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(queue: &'a dyn QueueAdapter, chain: &'a [Arc<dyn ReceiveMiddleware>]) -> Self {
        Self { queue, chain }
    }

    /// The queue this chain ends in.
    pub fn queue(&self) -> &dyn QueueAdapter {
        self.queue
    }

    pub async fn run(self, request: ReceiveRequest) -> Result<Vec<Message>, QueueError> {
        match self.chain.split_first() {
            Some((middleware, rest)) => middleware.handle(request, Next { queue: self.queue, chain: rest }).await,
            None => self.queue.fetch(&request).await,
        }
    }
}

/// Records each fetch in a `tracing` span.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReceiveTracing;

#[async_trait::async_trait]
impl ReceiveMiddleware for ReceiveTracing {
    async fn handle(&self, request: ReceiveRequest, next: Next<'_>) -> Result<Vec<Message>, QueueError> {
        use tracing::Instrument;

        let span = tracing::debug_span!("receive", queue = next.queue().name(), max = request.max_messages);
        async move {
            let res = next.run(request).await;
            match &res {
                Ok(messages) => tracing::trace!(count = messages.len(), "Fetch complete"),
                Err(e) => tracing::debug!(error = %e, "Fetch failed"),
            }
            res
        }
        .instrument(span)
        .await
    }
}
