use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueueError;

/// Attribute name asking the provider to return every attribute of a message.
pub const ALL_ATTRIBUTES: &str = "All";

/// A raw message as returned by a queue provider.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    /// Token identifying this particular receipt of the message. Each redelivery gets a new one.
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

/// Parameters of a single fetch call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub max_messages: usize,
    /// How long the provider may hold the call open waiting for messages (long polling).
    pub wait_time: Duration,
    pub attribute_names: Vec<String>,
}

/// The boundary with a queue provider. Implementations own the wire protocol: the pipeline only
/// ever fetches batches and acts on individual receipts.
///
/// A fetch is cancelled by dropping its future.
#[async_trait::async_trait]
pub trait QueueAdapter: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn uri(&self) -> &str;

    async fn fetch(&self, request: &ReceiveRequest) -> Result<Vec<Message>, QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn extend_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<(), QueueError>;
}

/// A received [`Message`] together with the queue it came from.
///
/// Handles are not [`Clone`]: each one travels from its receive buffer, through the
/// multiplexer, to exactly one consumer. A handle which is dropped without being [deleted] simply
/// reappears on its queue once its visibility timeout lapses.
///
/// [deleted]: Self::delete
pub struct MessageHandle {
    message: Message,
    queue: Arc<dyn QueueAdapter>,
}

impl std::fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandle").field("queue", &self.queue.name()).field("message", &self.message).finish()
    }
}

impl MessageHandle {
    pub fn new(message: Message, queue: Arc<dyn QueueAdapter>) -> Self {
        Self { message, queue }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn queue_uri(&self) -> &str {
        self.queue.uri()
    }

    /// Removes the message from its queue for good.
    pub async fn delete(&self) -> Result<(), QueueError> {
        self.queue.delete(&self.message.receipt_handle).await
    }

    /// Keeps the message hidden from other receivers for `timeout`, starting now.
    pub async fn extend_visibility(&self, timeout: Duration) -> Result<(), QueueError> {
        self.queue.extend_visibility(&self.message.receipt_handle, timeout).await
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}
