use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::Poll;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::error::{MultiplexerError, RunError};
use crate::lifecycle::{Completion, RunOnce};
use crate::macros::*;
use crate::message::MessageHandle;
use crate::receive_buffer::BufferReader;
use crate::sync::*;

/// The shared, finite sequence of messages produced by a [`Multiplexer`].
///
/// Clones read from the same underlying channel: each message is handed to exactly one caller of
/// [`next`], and the sequence ends for everyone once the multiplexer has closed its output and
/// every message in it has been read. It cannot be restarted.
///
/// [`next`]: Self::next
#[derive(Clone)]
pub struct MessageStream {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MessageHandle>>>,
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream").field("readers", &Arc::strong_count(&self.rx)).finish()
    }
}

impl MessageStream {
    pub async fn next(&self) -> Option<MessageHandle> {
        self.rx.lock().await.recv().await
    }
}

enum StreamSlot {
    /// `messages` has not been called yet.
    Unclaimed(mpsc::Receiver<MessageHandle>),
    /// Handed out; gone for good once every [`MessageStream`] has been dropped.
    Claimed(Weak<tokio::sync::Mutex<mpsc::Receiver<MessageHandle>>>),
}

/// One input of the multiplexer, with room to park a single message picked up while waiting for
/// any input to become ready.
struct Source {
    reader: BufferReader,
    parked: Option<MessageHandle>,
}

impl Source {
    fn try_next(&mut self) -> Poll<Option<MessageHandle>> {
        if let Some(message) = self.parked.take() {
            return Poll::Ready(Some(message));
        }

        match self.reader.try_recv() {
            Ok(message) => Poll::Ready(Some(message)),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Disconnected) => Poll::Ready(None),
        }
    }

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> Poll<()> {
        if self.parked.is_some() {
            return Poll::Ready(());
        }

        match self.reader.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                self.parked = Some(message);
                Poll::Ready(())
            }
            // Closed and drained: the next pass will see it as completed.
            Poll::Ready(None) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Resolves as soon as any source has a message or has completed.
    async fn ready_any(sources: &mut [Source]) {
        futures::future::poll_fn(|cx| {
            for source in sources.iter_mut() {
                if source.poll_ready(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
            Poll::Pending
        })
        .await
    }
}

/// Point-in-time view of a [`Multiplexer`], for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultiplexerSnapshot {
    pub capacity: usize,
    pub active_sources: usize,
    pub forwarded: usize,
    pub running: bool,
    pub completed: bool,
}

/// Merges the output of many [`ReceiveBuffer`]s into one bounded channel.
///
/// Every pass over the sources takes at most one message from each of them, in registration order,
/// so a busy queue can never starve the others sharing the multiplexer. Writes to the output block
/// while it is full, which stalls the pass and in turn every buffer feeding it.
///
/// A source is dropped once it has completed and been drained. When no sources are left the
/// output is closed: the output completes if and only if every registered source has completed.
///
/// [`ReceiveBuffer`]: crate::ReceiveBuffer
pub struct Multiplexer {
    capacity: usize,
    sources: tokio::sync::Mutex<Vec<Source>>,
    registered: tokio::sync::Notify,
    sender: sync::Mutex<Option<mpsc::Sender<MessageHandle>>>,
    stream: sync::Mutex<StreamSlot>,
    lifecycle: RunOnce<Completion>,
    active: AtomicUsize,
    forwarded: AtomicUsize,
    completed: AtomicBool,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer").field("snapshot", &self.interrogate()).finish()
    }
}

impl Multiplexer {
    /// # Panics
    ///
    /// If `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Tried to create a multiplexer with a capacity < 1");

        let (tx, rx) = mpsc::channel(capacity);
        Self {
            capacity,
            sources: tokio::sync::Mutex::new(Vec::new()),
            registered: tokio::sync::Notify::new(),
            sender: sync::Mutex::new(Some(tx)),
            stream: sync::Mutex::new(StreamSlot::Unclaimed(rx)),
            lifecycle: RunOnce::new(),
            active: AtomicUsize::new(0),
            forwarded: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
        }
    }

    /// Registers more sources. Sources registered after the multiplexer has completed are closed
    /// straight away.
    pub async fn read_from(&self, readers: impl IntoIterator<Item = BufferReader>) {
        // A running multiplexer with nothing to read holds the source lock while it waits, so it
        // has to be woken up before we can get in.
        self.registered.notify_one();

        let mut sources = self.sources.lock().await;
        if self.completed.load(Ordering::Acquire) {
            let dropped = readers.into_iter().count();
            tracing::warn!(dropped, "Multiplexer has already completed, sources will not be read");
            return;
        }

        for reader in readers {
            debug!(queue = reader.queue_name(), "Registering source");
            sources.push(Source { reader, parked: None });
        }
        self.active.store(sources.len(), Ordering::Release);
    }

    /// Starts forwarding messages. Every call returns the same completion handle, which resolves once
    /// all sources have completed and the output has been closed.
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) -> Completion {
        self.lifecycle.get_or_start(|| {
            let Some(output) = lock(&self.sender).take() else {
                return Completion::ready(Err(RunError::AlreadyStarted("Multiplexer".to_string())));
            };

            let multiplexer = Arc::clone(self);
            Completion::spawn("multiplexer", async move {
                multiplexer.pump(output, cancel).await;
                Ok(())
            })
        })
    }

    /// The multiplexed sequence of messages, shared by every caller.
    pub fn messages(&self) -> Result<MessageStream, MultiplexerError> {
        if !self.lifecycle.is_started() {
            return Err(MultiplexerError::NotStarted);
        }

        let mut slot = lock(&self.stream);
        match std::mem::replace(&mut *slot, StreamSlot::Claimed(Weak::new())) {
            StreamSlot::Unclaimed(rx) => {
                let rx = Arc::new(tokio::sync::Mutex::new(rx));
                *slot = StreamSlot::Claimed(Arc::downgrade(&rx));
                Ok(MessageStream { rx })
            }
            StreamSlot::Claimed(weak) => {
                let rx = weak.upgrade();
                *slot = StreamSlot::Claimed(weak);
                rx.map(|rx| MessageStream { rx }).ok_or(MultiplexerError::Completed)
            }
        }
    }

    pub fn interrogate(&self) -> MultiplexerSnapshot {
        MultiplexerSnapshot {
            capacity: self.capacity,
            active_sources: self.active.load(Ordering::Acquire),
            forwarded: self.forwarded.load(Ordering::Acquire),
            running: self.lifecycle.is_started(),
            completed: self.completed.load(Ordering::Acquire),
        }
    }

    async fn pump(&self, output: mpsc::Sender<MessageHandle>, cancel: CancellationToken) {
        tracing::info!(capacity = self.capacity, sources = self.active.load(Ordering::Acquire), "Multiplexer started");
        let mut shutdown_logged = false;

        loop {
            let mut sources = self.sources.lock().await;
            if sources.is_empty() {
                self.completed.store(true, Ordering::Release);
                break;
            }

            let mut forwarded = 0;
            let mut index = 0;
            while index < sources.len() {
                match sources[index].try_next() {
                    Poll::Ready(Some(message)) => {
                        trace!(queue = sources[index].reader.queue_name(), id = message.id(), "Forwarding message");
                        if output.send(message).await.is_err() {
                            tracing::warn!("Nothing is reading from the multiplexer anymore, stopping");
                            self.completed.store(true, Ordering::Release);
                            // Dropping the sources lets every buffer feeding us know.
                            sources.clear();
                            self.active.store(0, Ordering::Release);
                            return;
                        }
                        forwarded += 1;
                        index += 1;
                    }
                    Poll::Ready(None) => {
                        let source = sources.remove(index);
                        self.active.store(sources.len(), Ordering::Release);
                        tracing::info!(queue = source.reader.queue_name(), "Multiplexer source completed");
                    }
                    Poll::Pending => index += 1,
                }
            }
            self.forwarded.fetch_add(forwarded, Ordering::AcqRel);

            // Nothing was ready: park until something is rather than spinning over empty sources.
            if forwarded == 0 && !sources.is_empty() {
                tokio::select! {
                    _ = Source::ready_any(&mut sources) => {}
                    _ = self.registered.notified() => {}
                    _ = cancel.cancelled(), if !shutdown_logged => {
                        shutdown_logged = true;
                        tracing::info!("Shutdown requested, multiplexer draining its sources");
                    }
                }
            }
        }

        tracing::info!(forwarded = self.forwarded.load(Ordering::Acquire), "All sources completed, closing multiplexer");
        drop(output);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod test {
    use super::*;
    use crate::common::*;
    use crate::memory::InMemoryQueue;
    use crate::message::{Message, QueueAdapter};

    fn source(name: &str, cap: usize) -> (mpsc::Sender<MessageHandle>, BufferReader) {
        let (tx, rx) = mpsc::channel(cap);
        (tx, BufferReader::new(name, rx))
    }

    fn handle(queue: &Arc<dyn QueueAdapter>, id: String) -> MessageHandle {
        MessageHandle::new(Message { id, ..Default::default() }, Arc::clone(queue))
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn messages_before_run(#[allow(unused)] log_stdout: ()) {
        let multiplexer = Arc::new(Multiplexer::new(4));
        assert_matches::assert_matches!(multiplexer.messages(), Err(MultiplexerError::NotStarted));

        let completion = multiplexer.run(CancellationToken::new());
        assert!(multiplexer.messages().is_ok());

        // No sources at all: the output completes straight away.
        assert_matches::assert_matches!(completion.await, Ok(()));
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn run_is_idempotent(#[allow(unused)] log_stdout: ()) {
        let multiplexer = Arc::new(Multiplexer::new(4));
        let (tx, reader) = source("a", 4);
        multiplexer.read_from([reader]).await;

        let cancel = CancellationToken::new();
        let first = multiplexer.run(cancel.clone());
        let second = multiplexer.run(cancel);
        assert!(first.ptr_eq(&second));

        drop(tx);
        assert_matches::assert_matches!(first.await, Ok(()));
        assert_matches::assert_matches!(second.await, Ok(()));
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn round_robin_fairness(#[allow(unused)] log_stdout: ()) {
        let queue_a: Arc<dyn QueueAdapter> = Arc::new(InMemoryQueue::new("a"));
        let queue_b: Arc<dyn QueueAdapter> = Arc::new(InMemoryQueue::new("b"));
        let (tx_a, reader_a) = source("a", 64);
        let (tx_b, reader_b) = source("b", 64);

        // Both sources stay non-empty for the whole window we look at.
        for i in 0..50 {
            tx_a.send(handle(&queue_a, format!("{i}"))).await.expect("Send failed");
            tx_b.send(handle(&queue_b, format!("{i}"))).await.expect("Send failed");
        }

        let multiplexer = Arc::new(Multiplexer::new(1));
        multiplexer.read_from([reader_a, reader_b]).await;
        let _completion = multiplexer.run(CancellationToken::new());
        let stream = multiplexer.messages().expect("Multiplexer not started");

        let mut order = vec![];
        for _ in 0..40 {
            let message = stream.next().await.expect("Stream ended early");
            order.push(message.queue_name().to_string());
        }

        for window in order.windows(2) {
            assert!(window.contains(&"a".to_string()), "Source a starved: {order:?}");
            assert!(window.contains(&"b".to_string()), "Source b starved: {order:?}");
        }
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn completes_iff_all_sources_complete(#[allow(unused)] log_stdout: ()) {
        let queue: Arc<dyn QueueAdapter> = Arc::new(InMemoryQueue::new("a"));
        let (tx_a, reader_a) = source("a", 4);
        let (tx_b, reader_b) = source("b", 4);

        let multiplexer = Arc::new(Multiplexer::new(4));
        multiplexer.read_from([reader_a, reader_b]).await;
        let completion = multiplexer.run(CancellationToken::new());
        let stream = multiplexer.messages().expect("Multiplexer not started");

        tx_a.send(handle(&queue, "last-a".to_string())).await.expect("Send failed");
        drop(tx_a);

        assert_eq!(stream.next().await.map(|m| m.id().to_string()), Some("last-a".to_string()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(multiplexer.interrogate().active_sources, 1);
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), completion.clone()).await;
        assert!(pending.is_err(), "Multiplexer completed with a live source");

        tx_b.send(handle(&queue, "last-b".to_string())).await.expect("Send failed");
        drop(tx_b);

        assert_eq!(stream.next().await.map(|m| m.id().to_string()), Some("last-b".to_string()));
        assert!(stream.next().await.is_none(), "Output was not closed");
        assert_matches::assert_matches!(completion.await, Ok(()));

        let snapshot = multiplexer.interrogate();
        assert!(snapshot.completed);
        assert_eq!(snapshot.active_sources, 0);
        assert_eq!(snapshot.forwarded, 2);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn late_registration_wakes_idle_pass(#[allow(unused)] log_stdout: ()) {
        let queue: Arc<dyn QueueAdapter> = Arc::new(InMemoryQueue::new("a"));
        let (tx_a, reader_a) = source("a", 4);

        let multiplexer = Arc::new(Multiplexer::new(4));
        multiplexer.read_from([reader_a]).await;
        let completion = multiplexer.run(CancellationToken::new());
        let stream = multiplexer.messages().expect("Multiplexer not started");

        // Let the pump go idle on the empty source.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (tx_b, reader_b) = source("b", 4);
        tokio::time::timeout(std::time::Duration::from_secs(1), multiplexer.read_from([reader_b]))
            .await
            .expect("Registration blocked by idle multiplexer");
        assert_eq!(multiplexer.interrogate().active_sources, 2);

        tx_b.send(handle(&queue, "from-b".to_string())).await.expect("Send failed");
        assert_eq!(stream.next().await.map(|m| m.id().to_string()), Some("from-b".to_string()));

        drop(tx_a);
        drop(tx_b);
        assert_matches::assert_matches!(completion.await, Ok(()));
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn stream_is_shared_and_not_restartable(#[allow(unused)] log_stdout: ()) {
        let queue: Arc<dyn QueueAdapter> = Arc::new(InMemoryQueue::new("a"));
        let (tx, reader) = source("a", 8);
        for i in 0..6 {
            tx.send(handle(&queue, format!("{i}"))).await.expect("Send failed");
        }
        drop(tx);

        let multiplexer = Arc::new(Multiplexer::new(8));
        multiplexer.read_from([reader]).await;
        let completion = multiplexer.run(CancellationToken::new());

        let first = multiplexer.messages().expect("Multiplexer not started");
        let second = multiplexer.messages().expect("Multiplexer not started");

        let mut seen = vec![];
        while let Some(message) = first.next().await {
            seen.push(message.id().to_string());
            if let Some(message) = second.next().await {
                seen.push(message.id().to_string());
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["0", "1", "2", "3", "4", "5"]);
        assert_matches::assert_matches!(completion.await, Ok(()));

        drop(first);
        drop(second);
        assert_matches::assert_matches!(multiplexer.messages(), Err(MultiplexerError::Completed));
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn dropped_output_releases_sources(#[allow(unused)] log_stdout: ()) {
        let queue: Arc<dyn QueueAdapter> = Arc::new(InMemoryQueue::new("a"));
        let (tx, reader) = source("a", 4);

        let multiplexer = Arc::new(Multiplexer::new(1));
        multiplexer.read_from([reader]).await;
        let completion = multiplexer.run(CancellationToken::new());
        drop(multiplexer.messages().expect("Multiplexer not started"));

        tx.send(handle(&queue, "orphan".to_string())).await.expect("Send failed");
        assert_matches::assert_matches!(completion.await, Ok(()));
        tokio::time::timeout(std::time::Duration::from_secs(1), tx.closed()).await.expect("Source was not released");
    }
}
