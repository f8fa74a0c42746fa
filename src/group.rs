use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::consumer::Consumer;
use crate::lifecycle::{Completion, RunOnce};
use crate::multiplexer::{Multiplexer, MultiplexerSnapshot};
use crate::receive_buffer::{ReceiveBuffer, ReceiveBufferSnapshot};
use crate::settings::SubscriptionGroupSettings;

/// Point-in-time view of a [`SubscriptionGroup`], for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionGroupSnapshot {
    pub name: String,
    pub concurrency_limit: usize,
    pub running: bool,
    /// Messages dispatched successfully, across all consumers.
    pub dispatched: usize,
    pub multiplexer: MultiplexerSnapshot,
    pub buffers: Vec<ReceiveBufferSnapshot>,
}

/// One receive buffer per queue, a multiplexer merging them and `concurrency_limit` consumers
/// reading from it, run as a single unit.
///
/// Build groups with a [`SubscriptionGroupFactory`].
///
/// [`SubscriptionGroupFactory`]: crate::SubscriptionGroupFactory
pub struct SubscriptionGroup {
    settings: SubscriptionGroupSettings,
    buffers: Vec<Arc<ReceiveBuffer>>,
    multiplexer: Arc<Multiplexer>,
    consumers: Vec<Arc<Consumer>>,
    lifecycle: RunOnce<Completion>,
}

impl std::fmt::Debug for SubscriptionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGroup").field("snapshot", &self.interrogate()).finish()
    }
}

impl SubscriptionGroup {
    pub(crate) fn new(
        settings: SubscriptionGroupSettings,
        buffers: Vec<Arc<ReceiveBuffer>>,
        multiplexer: Arc<Multiplexer>,
        consumers: Vec<Arc<Consumer>>,
    ) -> Self {
        Self { settings, buffers, multiplexer, consumers, lifecycle: RunOnce::new() }
    }

    pub fn name(&self) -> &str {
        self.settings.name()
    }

    pub fn settings(&self) -> &SubscriptionGroupSettings {
        &self.settings
    }

    /// Starts every buffer, the multiplexer and every consumer, and returns their joint completion.
    ///
    /// Only the first call starts anything: later calls get a clone of the same handle. The handle
    /// resolves once every task has finished. If any of them failed it resolves with the first
    /// failure, but a failure does not stop the others.
    pub fn run(&self, cancel: CancellationToken) -> Completion {
        self.lifecycle.get_or_start(|| {
            tracing::info!(
                group = self.name(),
                queues = self.buffers.len(),
                concurrency_limit = self.consumers.len(),
                "Starting subscription group"
            );

            let mut tasks = Vec::with_capacity(1 + self.buffers.len() + self.consumers.len());

            // Consumers can only subscribe to a running multiplexer.
            tasks.push(self.multiplexer.run(cancel.clone()));

            for buffer in &self.buffers {
                let buffer = Arc::clone(buffer);
                let cancel = cancel.clone();
                let name = format!("receive buffer '{}'", buffer.queue_name());
                tasks.push(Completion::spawn(name, async move { buffer.run(cancel).await }));
            }

            // Claimed once up front: the sequence stays open until every consumer has let go of it.
            match self.multiplexer.messages() {
                Ok(messages) => {
                    for consumer in &self.consumers {
                        let consumer = Arc::clone(consumer);
                        let messages = messages.clone();
                        let cancel = cancel.clone();
                        let name = format!("consumer {} of '{}'", consumer.id(), self.name());
                        tasks.push(Completion::spawn(name, async move { consumer.run(messages, cancel).await }));
                    }
                }
                Err(e) => {
                    tracing::error!(group = self.name(), error = %e, "Consumers could not subscribe to the multiplexer");
                    tasks.push(Completion::ready(Err(e.into())));
                }
            }

            let group = self.name().to_string();
            let joint = Completion::join_all(tasks);
            Completion::new(async move {
                let res = joint.await;
                match &res {
                    Ok(()) => tracing::info!(group = %group, "Subscription group stopped"),
                    Err(e) => tracing::error!(group = %group, error = %e, "Subscription group failed"),
                }
                res
            })
        })
    }

    /// Safe to call at any time, including while running. Never affects the group.
    pub fn interrogate(&self) -> SubscriptionGroupSnapshot {
        SubscriptionGroupSnapshot {
            name: self.name().to_string(),
            concurrency_limit: self.settings.concurrency_limit(),
            running: self.lifecycle.is_started(),
            dispatched: self.consumers.iter().map(|consumer| consumer.dispatched()).sum(),
            multiplexer: self.multiplexer.interrogate(),
            buffers: self.buffers.iter().map(|buffer| buffer.interrogate()).collect(),
        }
    }
}

/// Several [`SubscriptionGroup`]s run as one.
pub struct SubscriptionGroupCollection {
    groups: Vec<SubscriptionGroup>,
    lifecycle: RunOnce<Completion>,
}

impl std::fmt::Debug for SubscriptionGroupCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.groups).finish()
    }
}

impl SubscriptionGroupCollection {
    pub fn new(groups: Vec<SubscriptionGroup>) -> Self {
        Self { groups, lifecycle: RunOnce::new() }
    }

    pub fn groups(&self) -> &[SubscriptionGroup] {
        &self.groups
    }

    /// Same contract as [`SubscriptionGroup::run`], across every group. A failed group does not
    /// stop the others.
    pub fn run(&self, cancel: CancellationToken) -> Completion {
        self.lifecycle.get_or_start(|| {
            tracing::info!(groups = self.groups.len(), "Starting subscription groups");
            Completion::join_all(self.groups.iter().map(|group| group.run(cancel.clone())).collect())
        })
    }

    pub fn interrogate(&self) -> Vec<SubscriptionGroupSnapshot> {
        self.groups.iter().map(SubscriptionGroup::interrogate).collect()
    }
}
