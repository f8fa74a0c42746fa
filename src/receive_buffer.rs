use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, RunError};
use crate::macros::*;
use crate::message::{ALL_ATTRIBUTES, Message, MessageHandle, QueueAdapter, ReceiveRequest};
use crate::middleware::{Next, ReceiveMiddleware};
use crate::monitor::{Monitor, NullMonitor};
use crate::sync::*;

/// How long a receive buffer waits for room in its channel before checking for cancellation again.
///
/// Independent from the cancellation token: messages which were already accepted keep flowing
/// downstream for a little while after shutdown has been requested.
pub const CAPACITY_WAIT: Duration = Duration::from_millis(100);

/// Everything a [`ReceiveBuffer`] needs besides its queue.
#[derive(Clone)]
pub struct ReceiveBufferConfig {
    /// Capacity of the buffer's channel.
    pub buffer_size: usize,
    /// Messages requested per fetch.
    pub prefetch: usize,
    /// Upper bound on a single fetch, middlewares included.
    pub read_timeout: Duration,
    /// Long-polling wait passed on to the provider.
    pub wait_time: Duration,
    pub attribute_names: Vec<String>,
    pub middlewares: Vec<Arc<dyn ReceiveMiddleware>>,
    pub monitor: Arc<dyn Monitor>,
}

impl Default for ReceiveBufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10,
            prefetch: 10,
            read_timeout: Duration::from_secs(5 * 60),
            wait_time: Duration::from_secs(20),
            attribute_names: vec![ALL_ATTRIBUTES.to_string()],
            middlewares: vec![],
            monitor: Arc::new(NullMonitor),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStatus {
    NotStarted,
    Running,
    Stopped,
}

impl BufferStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotStarted,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Point-in-time view of a [`ReceiveBuffer`], for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveBufferSnapshot {
    pub queue_name: String,
    pub queue_uri: String,
    pub buffer_size: usize,
    pub prefetch: usize,
    pub read_timeout: Duration,
    pub wait_time: Duration,
    /// Messages sitting in the channel, waiting for the multiplexer.
    pub buffered: usize,
    pub status: BufferStatus,
    pub fetches: usize,
    pub received: usize,
    /// Messages received but never buffered because the buffer stopped first. They reappear on their
    /// queue once their visibility timeout lapses.
    pub released: usize,
    pub failures: usize,
}

/// The read end of a [`ReceiveBuffer`]'s channel. Completes once the buffer has stopped and every
/// message it accepted has been read.
pub struct BufferReader {
    queue: String,
    rx: mpsc::Receiver<MessageHandle>,
}

impl std::fmt::Debug for BufferReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferReader").field("queue", &self.queue).field("len", &self.rx.len()).finish()
    }
}

impl BufferReader {
    pub(crate) fn new(queue: impl Into<String>, rx: mpsc::Receiver<MessageHandle>) -> Self {
        Self { queue: queue.into(), rx }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub(crate) fn try_recv(&mut self) -> Result<MessageHandle, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    pub(crate) fn poll_recv(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<MessageHandle>> {
        self.rx.poll_recv(cx)
    }
}

/// Pre-fetches messages from one queue into a bounded channel.
///
/// Each iteration waits for room in the channel, fetches up to `prefetch` messages and writes them
/// out one by one. Writing blocks while the channel is full: this is where a slow consumer pool
/// throttles the rate at which we fetch from the provider. Failed fetches are reported and simply
/// tried again on the next iteration.
///
/// A buffer runs once. When it stops it drops its end of the channel so that the multiplexer reading
/// from it can tell it is done.
pub struct ReceiveBuffer {
    queue: Arc<dyn QueueAdapter>,
    config: ReceiveBufferConfig,
    sender: sync::Mutex<Option<mpsc::Sender<MessageHandle>>>,
    weak: mpsc::WeakSender<MessageHandle>,
    status: AtomicU8,
    fetches: AtomicUsize,
    received: AtomicUsize,
    released: AtomicUsize,
    failures: AtomicUsize,
}

impl std::fmt::Debug for ReceiveBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveBuffer").field("snapshot", &self.interrogate()).finish()
    }
}

impl ReceiveBuffer {
    /// Creates a buffer over `queue` along with the reader for its channel.
    ///
    /// # Panics
    ///
    /// If `config.buffer_size` is 0.
    pub fn new(queue: Arc<dyn QueueAdapter>, config: ReceiveBufferConfig) -> (Self, BufferReader) {
        assert!(config.buffer_size > 0, "Tried to create a receive buffer with a capacity < 1");

        let (tx, rx) = mpsc::channel(config.buffer_size);
        let reader = BufferReader::new(queue.name(), rx);
        let buffer = Self {
            weak: tx.downgrade(),
            sender: sync::Mutex::new(Some(tx)),
            queue,
            config,
            status: AtomicU8::new(BufferStatus::NotStarted as u8),
            fetches: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        };

        (buffer, reader)
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Receives messages until `cancel` fires or nobody is reading anymore, then closes the channel.
    #[cfg_attr(test, tracing::instrument(skip_all, fields(queue = self.queue_name())))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RunError> {
        let Some(tx) = lock(&self.sender).take() else {
            return Err(RunError::AlreadyStarted(format!("Receive buffer for queue '{}'", self.queue_name())));
        };

        self.status.store(BufferStatus::Running as u8, Ordering::Release);
        tracing::info!(
            queue = self.queue_name(),
            prefetch = self.config.prefetch,
            buffer_size = self.config.buffer_size,
            "Receive buffer started"
        );

        if self.config.prefetch == 0 {
            // Nothing would ever be fetched: idle until shutdown rather than polling the queue.
            tracing::warn!(queue = self.queue_name(), "Receive buffer has a prefetch of 0, it will not fetch anything");
            cancel.cancelled().await;
        } else {
            self.pump(&tx, &cancel).await;
        }

        drop(tx);
        self.status.store(BufferStatus::Stopped as u8, Ordering::Release);
        tracing::info!(queue = self.queue_name(), "Receive buffer stopped");

        Ok(())
    }

    async fn pump(&self, tx: &mpsc::Sender<MessageHandle>, cancel: &CancellationToken) {
        'receive: loop {
            if cancel.is_cancelled() {
                debug!("Cancellation requested, no more fetches");
                break;
            }

            let full = tx.capacity() == 0;
            let start = Instant::now();
            match tokio::time::timeout(CAPACITY_WAIT, tx.reserve()).await {
                Ok(Ok(permit)) => {
                    drop(permit);
                    if full {
                        self.config.monitor.throttle_time(self.queue_name(), start.elapsed());
                    }
                }
                Ok(Err(_)) => {
                    tracing::info!(queue = self.queue_name(), "Receive buffer reader is gone, stopping");
                    break;
                }
                Err(_) => {
                    trace!("Channel still full");
                    self.config.monitor.throttle_time(self.queue_name(), start.elapsed());
                    continue;
                }
            }

            let Some(messages) = self.receive(cancel).await else {
                debug!("Fetch interrupted by cancellation");
                break;
            };

            let mut messages = messages.into_iter();
            while let Some(message) = messages.next() {
                let handle = MessageHandle::new(message, Arc::clone(&self.queue));
                tokio::select! {
                    biased;
                    res = tx.send(handle) => {
                        if res.is_err() {
                            self.released.fetch_add(messages.len() + 1, Ordering::AcqRel);
                            tracing::info!(queue = self.queue_name(), "Receive buffer reader is gone, stopping");
                            break 'receive;
                        }
                    }
                    _ = cancel.cancelled() => {
                        // These are still hidden on the queue and will be redelivered once their
                        // visibility timeout lapses.
                        self.released.fetch_add(messages.len() + 1, Ordering::AcqRel);
                        tracing::debug!(
                            queue = self.queue_name(),
                            released = messages.len() + 1,
                            "Released messages which could not be buffered before shutdown"
                        );
                        break 'receive;
                    }
                }
            }
        }
    }

    /// One fetch through the middleware chain. Returns `None` if cancelled, and an empty batch if the
    /// fetch failed.
    async fn receive(&self, cancel: &CancellationToken) -> Option<Vec<Message>> {
        let request = ReceiveRequest {
            max_messages: self.config.prefetch,
            wait_time: self.config.wait_time,
            attribute_names: self.config.attribute_names.clone(),
        };

        self.fetches.fetch_add(1, Ordering::AcqRel);
        let start = Instant::now();
        let chain = Next::new(self.queue.as_ref(), &self.config.middlewares);

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            res = tokio::time::timeout(self.config.read_timeout, chain.run(request)) => res,
        };

        match res.unwrap_or_else(|_| Err(QueueError::Timeout(self.config.read_timeout))) {
            Ok(messages) => {
                trace!(count = messages.len(), "Received messages");
                self.received.fetch_add(messages.len(), Ordering::AcqRel);
                self.config.monitor.receive_time(self.queue_name(), start.elapsed(), messages.len());
                Some(messages)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(queue = self.queue_name(), error = %e, "Failed to receive messages, will retry");
                self.config.monitor.receive_error(self.queue_name(), &e);
                Some(Vec::new())
            }
        }
    }

    pub fn interrogate(&self) -> ReceiveBufferSnapshot {
        let buffered = self.weak.upgrade().map_or(0, |tx| tx.max_capacity() - tx.capacity());
        ReceiveBufferSnapshot {
            queue_name: self.queue.name().to_string(),
            queue_uri: self.queue.uri().to_string(),
            buffer_size: self.config.buffer_size,
            prefetch: self.config.prefetch,
            read_timeout: self.config.read_timeout,
            wait_time: self.config.wait_time,
            buffered,
            status: BufferStatus::from_u8(self.status.load(Ordering::Acquire)),
            fetches: self.fetches.load(Ordering::Acquire),
            received: self.received.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
            failures: self.failures.load(Ordering::Acquire),
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod test {
    use super::*;
    use crate::common::*;
    use crate::memory::InMemoryQueue;

    fn config(buffer_size: usize, prefetch: usize) -> ReceiveBufferConfig {
        ReceiveBufferConfig { buffer_size, prefetch, wait_time: Duration::from_millis(20), ..Default::default() }
    }

    async fn drain(reader: &mut BufferReader) -> Vec<String> {
        let mut bodies = vec![];
        while let Some(handle) = reader.rx.recv().await {
            bodies.push(handle.message().body.clone());
        }
        bodies
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn buffers_in_fetch_order(#[allow(unused)] log_stdout: ()) {
        let queue = Arc::new(InMemoryQueue::new("orders"));
        for i in 0..25 {
            queue.send(format!("{i}")).await;
        }

        let (buffer, mut reader) = ReceiveBuffer::new(queue.clone(), config(10, 10));
        let buffer = Arc::new(buffer);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let buffer = Arc::clone(&buffer);
            let cancel = cancel.clone();
            async move { buffer.run(cancel).await }
        });

        let mut bodies = vec![];
        for _ in 0..25 {
            let handle = reader.rx.recv().await.expect("Channel closed early");
            bodies.push(handle.message().body.clone());
        }
        cancel.cancel();

        assert_eq!(drain(&mut reader).await, Vec::<String>::new());
        assert_matches::assert_matches!(task.await, Ok(Ok(())));
        assert_eq!(bodies, (0..25).map(|i| i.to_string()).collect::<Vec<_>>());
        assert_eq!(buffer.interrogate().status, BufferStatus::Stopped);
        assert_eq!(buffer.interrogate().received, 25);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn closes_channel_on_cancel(#[allow(unused)] log_stdout: ()) {
        let queue = Arc::new(InMemoryQueue::new("orders"));
        let (buffer, mut reader) = ReceiveBuffer::new(queue, config(4, 2));
        let cancel = CancellationToken::new();

        let run = buffer.run(cancel.clone());
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), run).await.expect("Buffer did not stop").expect("Buffer failed");
        assert!(reader.rx.recv().await.is_none(), "Channel was not closed");
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn retries_after_failed_fetch(#[allow(unused)] log_stdout: ()) {
        #[derive(Default)]
        struct Errors(std::sync::Mutex<Vec<QueueError>>);

        impl Monitor for Errors {
            fn receive_error(&self, _queue: &str, error: &QueueError) {
                self.0.lock().expect("Poisoned").push(error.clone());
            }
        }

        let queue = Arc::new(InMemoryQueue::new("orders"));
        queue.send("survivor").await;
        queue.fail_next_fetches(3);

        let monitor = Arc::new(Errors::default());
        let config = ReceiveBufferConfig { monitor: monitor.clone(), ..config(4, 2) };
        let (buffer, mut reader) = ReceiveBuffer::new(queue.clone(), config);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { buffer.run(cancel).await }
        });

        let handle = tokio::time::timeout(Duration::from_secs(1), reader.rx.recv())
            .await
            .expect("Buffer never recovered")
            .expect("Channel closed early");
        cancel.cancel();

        assert_eq!(handle.message().body, "survivor");
        assert_eq!(monitor.0.lock().expect("Poisoned").len(), 3);
        assert!(queue.fetch_count() >= 4);
        assert_matches::assert_matches!(task.await, Ok(Ok(())));
    }

    #[rstest::rstest]
    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out(#[allow(unused)] log_stdout: ()) {
        struct Stuck;

        #[async_trait::async_trait]
        impl QueueAdapter for Stuck {
            fn name(&self) -> &str {
                "stuck"
            }

            fn uri(&self) -> &str {
                "memory://stuck"
            }

            async fn fetch(&self, _request: &ReceiveRequest) -> Result<Vec<Message>, QueueError> {
                futures::future::pending().await
            }

            async fn delete(&self, _receipt_handle: &str) -> Result<(), QueueError> {
                Ok(())
            }

            async fn extend_visibility(&self, _receipt_handle: &str, _timeout: Duration) -> Result<(), QueueError> {
                Ok(())
            }
        }

        let config = ReceiveBufferConfig { read_timeout: Duration::from_secs(1), ..config(4, 2) };
        let (buffer, _reader) = ReceiveBuffer::new(Arc::new(Stuck), config);
        let buffer = Arc::new(buffer);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let buffer = Arc::clone(&buffer);
            let cancel = cancel.clone();
            async move { buffer.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        assert_matches::assert_matches!(task.await, Ok(Ok(())));

        let snapshot = buffer.interrogate();
        assert_eq!(snapshot.failures, 3);
        assert_eq!(snapshot.fetches, 4);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn zero_prefetch_never_fetches(#[allow(unused)] log_stdout: ()) {
        let queue = Arc::new(InMemoryQueue::new("orders"));
        queue.send("untouched").await;

        let config = ReceiveBufferConfig { wait_time: Duration::from_secs(20), ..config(4, 0) };
        let (buffer, mut reader) = ReceiveBuffer::new(queue.clone(), config);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { buffer.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.fetch_count(), 0);

        cancel.cancel();
        assert_matches::assert_matches!(tokio::time::timeout(Duration::from_secs(1), task).await, Ok(Ok(Ok(()))));
        assert!(reader.rx.recv().await.is_none(), "Channel was not closed");
        assert_eq!(queue.in_flight().await, 0);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn runs_only_once(#[allow(unused)] log_stdout: ()) {
        let queue = Arc::new(InMemoryQueue::new("orders"));
        let (buffer, _reader) = ReceiveBuffer::new(queue, config(4, 2));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_matches::assert_matches!(buffer.run(cancel.clone()).await, Ok(()));
        assert_matches::assert_matches!(buffer.run(cancel).await, Err(RunError::AlreadyStarted(_)));
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn snapshot_reports_buffered(#[allow(unused)] log_stdout: ()) {
        let queue = Arc::new(InMemoryQueue::new("orders"));
        for i in 0..6 {
            queue.send(format!("{i}")).await;
        }

        let (buffer, _reader) = ReceiveBuffer::new(queue, config(4, 4));
        let buffer = Arc::new(buffer);
        assert_eq!(buffer.interrogate().status, BufferStatus::NotStarted);

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let buffer = Arc::clone(&buffer);
            let cancel = cancel.clone();
            async move { buffer.run(cancel).await }
        });

        tokio::time::timeout(Duration::from_secs(1), async {
            while buffer.interrogate().buffered < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Buffer never filled up");

        let snapshot = buffer.interrogate();
        assert_eq!(snapshot.status, BufferStatus::Running);
        assert_eq!(snapshot.buffered, 4);
        assert_eq!(snapshot.queue_name, "orders");
        assert_eq!(snapshot.queue_uri, "memory://orders");

        cancel.cancel();
        assert_matches::assert_matches!(task.await, Ok(Ok(())));
    }
}
