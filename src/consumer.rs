use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, RunError};
use crate::macros::*;
use crate::message::MessageHandle;
use crate::multiplexer::MessageStream;

/// Hands a message over to application code.
///
/// Whatever happens on the other side (handler resolution, retries, deleting the message or
/// letting it reappear on its queue) is up to the implementation. Returning an error stops the
/// consumer which made the call.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, message: MessageHandle, cancel: CancellationToken) -> Result<(), DispatchError>;
}

#[async_trait::async_trait]
impl<F, Fut> Dispatcher for F
where
    F: Fn(MessageHandle, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    async fn dispatch(&self, message: MessageHandle, cancel: CancellationToken) -> Result<(), DispatchError> {
        (self)(message, cancel).await
    }
}

/// One worker of a subscription group: reads the multiplexed sequence and dispatches messages one
/// at a time. Running several consumers over the same [`MessageStream`] is what bounds a group's
/// concurrency.
pub struct Consumer {
    id: usize,
    group: String,
    dispatcher: Arc<dyn Dispatcher>,
    dispatched: AtomicUsize,
}

impl Consumer {
    pub fn new(id: usize, group: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { id, group: group.into(), dispatcher, dispatched: AtomicUsize::new(0) }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Messages dispatched successfully so far.
    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Dispatches messages from `messages` until the sequence ends.
    ///
    /// `cancel` is only passed on to the dispatcher: a consumer keeps reading after shutdown has been
    /// requested so that messages which were already buffered still get dispatched.
    pub async fn run(&self, messages: MessageStream, cancel: CancellationToken) -> Result<(), RunError> {
        debug!(group = %self.group, consumer = self.id, "Consumer started");

        while let Some(message) = messages.next().await {
            let message_id = message.id().to_string();
            trace!(consumer = self.id, id = %message_id, queue = message.queue_name(), "Dispatching message");

            if let Err(e) = self.dispatcher.dispatch(message, cancel.clone()).await {
                tracing::error!(group = %self.group, consumer = self.id, id = %message_id, error = %e, "Dispatch failed, stopping consumer");
                return Err(RunError::Dispatch { consumer: self.id, message_id, source: Arc::new(e) });
            }
            self.dispatched.fetch_add(1, Ordering::AcqRel);
        }

        debug!(group = %self.group, consumer = self.id, dispatched = self.dispatched(), "Consumer finished");
        Ok(())
    }
}
