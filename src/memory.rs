use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::QueueError;
use crate::macros::*;
use crate::message::{ALL_ATTRIBUTES, Message, QueueAdapter, ReceiveRequest};

/// How long a received message stays hidden unless told otherwise.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// An in-process queue with the delivery semantics of a cloud queue: messages are delivered at
/// least once, hidden from other receivers for a visibility timeout after each receipt, and
/// redelivered with a fresh receipt handle if they are not deleted in time.
///
/// Messages are handed out in the order they were sent, skipping the ones currently in flight.
/// Fetches long-poll for up to the request's `wait_time` when nothing is visible.
pub struct InMemoryQueue {
    name: String,
    uri: String,
    visibility_timeout: Duration,
    state: tokio::sync::Mutex<VecDeque<Entry>>,
    available: tokio::sync::Notify,
    next_id: AtomicU64,
    fetches: AtomicUsize,
    failures: AtomicUsize,
}

struct Entry {
    message: Message,
    visible_at: Instant,
    receive_count: u32,
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("name", &self.name)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("fetches", &self.fetch_count())
            .finish()
    }
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_visibility_timeout(name, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        let name = name.into();
        Self {
            uri: format!("memory://{name}"),
            name,
            visibility_timeout,
            state: tokio::sync::Mutex::new(VecDeque::new()),
            available: tokio::sync::Notify::new(),
            next_id: AtomicU64::new(0),
            fetches: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Enqueues a message and returns its id.
    pub async fn send(&self, body: impl Into<String>) -> String {
        self.send_with_attributes(body, HashMap::new()).await
    }

    pub async fn send_with_attributes(&self, body: impl Into<String>, attributes: HashMap<String, String>) -> String {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel).to_string();
        let message = Message { id: id.clone(), receipt_handle: String::new(), body: body.into(), attributes };

        self.state.lock().await.push_back(Entry { message, visible_at: Instant::now(), receive_count: 0 });
        self.available.notify_waiters();

        debug!(queue = %self.name, %id, "Message sent");
        id
    }

    /// Makes the next `count` fetches fail with a provider error.
    pub fn fail_next_fetches(&self, count: usize) {
        self.failures.store(count, Ordering::Release);
    }

    /// Number of fetch calls made so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Acquire)
    }

    /// Number of messages which have not been deleted, in flight or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of messages currently hidden by a receipt.
    pub async fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.state.lock().await.iter().filter(|entry| entry.visible_at > now).count()
    }

    fn take_failure(&self) -> bool {
        self.failures.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)).is_ok()
    }

    fn receive(&self, entries: &mut VecDeque<Entry>, now: Instant, request: &ReceiveRequest) -> Vec<Message> {
        let all = request.attribute_names.iter().any(|name| name == ALL_ATTRIBUTES);

        entries
            .iter_mut()
            .filter(|entry| entry.visible_at <= now)
            .take(request.max_messages)
            .map(|entry| {
                entry.receive_count += 1;
                entry.visible_at = now + self.visibility_timeout;
                entry.message.receipt_handle = format!("{}#{}", entry.message.id, entry.receive_count);

                let mut message = entry.message.clone();
                if !all {
                    message.attributes.retain(|key, _| request.attribute_names.contains(key));
                }
                message
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl QueueAdapter for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn fetch(&self, request: &ReceiveRequest) -> Result<Vec<Message>, QueueError> {
        self.fetches.fetch_add(1, Ordering::AcqRel);
        if self.take_failure() {
            return Err(QueueError::Provider(format!("injected failure on {}", self.name)));
        }

        let deadline = Instant::now() + request.wait_time;
        loop {
            // Registered before looking at the queue so that a send racing with us is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut entries = self.state.lock().await;
                let now = Instant::now();
                let batch = self.receive(&mut entries, now, request);

                if !batch.is_empty() || now >= deadline {
                    trace!(queue = %self.name, count = batch.len(), "Fetch complete");
                    return Ok(batch);
                }

                // Wakes up for the next message to come back into view, not for the visible ones.
                entries
                    .iter()
                    .map(|entry| entry.visible_at)
                    .filter(|at| *at > now)
                    .min()
                    .map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut entries = self.state.lock().await;
        match entries.iter().position(|entry| !receipt_handle.is_empty() && entry.message.receipt_handle == receipt_handle) {
            Some(index) => {
                entries.remove(index);
                debug!(queue = %self.name, receipt_handle, "Message deleted");
                Ok(())
            }
            None => Err(QueueError::ReceiptNotFound(receipt_handle.to_string())),
        }
    }

    async fn extend_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<(), QueueError> {
        let mut entries = self.state.lock().await;
        let entry = entries
            .iter_mut()
            .find(|entry| !receipt_handle.is_empty() && entry.message.receipt_handle == receipt_handle)
            .ok_or_else(|| QueueError::ReceiptNotFound(receipt_handle.to_string()))?;

        entry.visible_at = Instant::now() + timeout;
        drop(entries);

        if timeout.is_zero() {
            self.available.notify_waiters();
        }
        Ok(())
    }
}
