//! `rust-mq-subscriber` is the intake side of a publish/subscribe client: it pulls messages from
//! many independently paced queues, buffers them, interleaves them fairly into a single stream and
//! fans that stream out to a bounded pool of concurrent workers, with backpressure from end to end
//! and a single cancellation signal to shut it all down.
//!
//! Delivery is at-least-once. Messages which are not explicitly [deleted] reappear on their queue
//! once their visibility timeout lapses.
//!
//! # Usage
//!
//! Each queue the pipeline reads from is an implementation of [`QueueAdapter`]. Queues are
//! organized into named subscription groups sharing one concurrency profile, configured through a
//! [`SubscriptionConfig`] and turned into a runnable [`SubscriptionGroupCollection`] by a
//! [`SubscriptionGroupFactory`]. Inside every group:
//!
//! ```text
//!   queue ──▶ ReceiveBuffer ──┐
//!                             │                  ┌──▶ Consumer ──▶ Dispatcher
//!   queue ──▶ ReceiveBuffer ──┼──▶ Multiplexer ──┼──▶ Consumer ──▶ Dispatcher
//!                             │                  └──▶ Consumer ──▶ Dispatcher
//!   queue ──▶ ReceiveBuffer ──┘
//! ```
//!
//! 1. A [`ReceiveBuffer`] per queue pre-fetches batches of up to `prefetch` messages into a bounded
//!    channel of `buffer_size` messages.
//!
//! 2. A [`Multiplexer`] reads one message at a time from each buffer in turn, so that a busy queue
//!    cannot starve the others, and writes them to a bounded channel of `multiplexer_capacity`
//!    messages.
//!
//! 3. `concurrency_limit` [`Consumer`]s share the multiplexed stream and hand each message over to
//!    a [`Dispatcher`], one at a time.
//!
//! Bounded channels are the only backpressure mechanism: a slow consumer pool stalls the
//! multiplexer, which stalls every buffer, which stops fetching from the queues.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use rust_mq_subscriber::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = Arc::new(InMemoryQueue::new("orders"));
//!     queue.send("hello").await;
//!
//!     let config = SubscriptionConfig::default()
//!         .add_queue(None, queue.clone())
//!         .with_group("orders", |group| group.with_concurrency_limit(2));
//!
//!     let cancel = CancellationToken::new();
//!     let dispatcher = {
//!         let cancel = cancel.clone();
//!         move |message: MessageHandle, _: CancellationToken| {
//!             let cancel = cancel.clone();
//!             async move {
//!                 message.delete().await.map_err(DispatchError::new)?;
//!                 cancel.cancel();
//!                 Ok::<_, DispatchError>(())
//!             }
//!         }
//!     };
//!
//!     let factory = SubscriptionGroupFactory::new(Arc::new(dispatcher));
//!     let groups = factory.create(&config).await.expect("Invalid settings");
//!
//!     // Resolves once everything has stopped.
//!     groups.run(cancel).await.expect("Pipeline failed");
//!     assert!(queue.is_empty().await);
//! }
//! ```
//!
//! Calling `run` more than once on a group, a collection or a multiplexer does not start it again:
//! every call returns the same [`Completion`].
//!
//! # Shutdown
//!
//! Cancelling the token passed to `run` stops every receive buffer from fetching. Each buffer then
//! closes its channel, the multiplexer notices it has no live sources left and closes its own
//! output, and consumers stop once they have dispatched what was already buffered. A cancelled
//! pipeline completes with `Ok(())`.
//!
//! Failures are isolated: a consumer whose dispatcher returns an error stops, but its siblings and
//! the other groups keep running. The joint [`Completion`] only resolves once everything has
//! stopped, with the first failure it saw.
//!
//! # Testing
//!
//! Single-start semantics are checked with [`loom`] under the `loom` feature, and [`proptest`] is
//! used under the `proptest` feature to run settings validation and the [`InMemoryQueue`] against
//! reference models. The rest of the pipeline is covered by scenario tests on a tokio runtime:
//! ordering on a single queue, fairness, backpressure, clean shutdown and single delivery across
//! consumers.
//!
//! # Known limitations
//!
//! ## Messages held during shutdown
//!
//! A batch which was fetched but not fully buffered by the time shutdown is requested is not
//! handed back to its queue: those messages only become visible again once their visibility
//! timeout lapses. Making the visibility of these messages expire straight away would require one
//! extra call per message against the queue during shutdown.
//!
//! ## Failed consumers are not restarted
//!
//! A consumer which stops on a dispatch error lowers the concurrency of its group for the rest of
//! the run. Dispatchers are expected to handle their own errors and only fail on bugs.
//!
//! [deleted]: MessageHandle::delete
//! [`loom`]: https://docs.rs/loom
//! [`proptest`]: https://docs.rs/proptest

mod consumer;
mod error;
mod factory;
mod group;
mod lifecycle;
mod macros;
mod memory;
mod message;
mod middleware;
mod monitor;
mod multiplexer;
mod receive_buffer;
mod settings;
mod sync;

#[cfg(test)]
mod common;

pub use consumer::*;
pub use error::*;
pub use factory::*;
pub use group::*;
pub use lifecycle::Completion;
pub use memory::*;
pub use message::*;
pub use middleware::*;
pub use monitor::*;
pub use multiplexer::*;
pub use receive_buffer::*;
pub use settings::*;
