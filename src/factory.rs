use std::sync::Arc;

use crate::consumer::{Consumer, Dispatcher};
use crate::error::ConfigError;
use crate::group::{SubscriptionGroup, SubscriptionGroupCollection};
use crate::message::ALL_ATTRIBUTES;
use crate::middleware::ReceiveMiddleware;
use crate::monitor::{Monitor, NullMonitor};
use crate::multiplexer::Multiplexer;
use crate::receive_buffer::{ReceiveBuffer, ReceiveBufferConfig};
use crate::settings::{SubscriptionConfig, SubscriptionGroupSettings};

/// Wires validated settings into runnable [`SubscriptionGroup`]s.
///
/// Everything the factory holds is shared by every group it creates: one dispatcher, one monitor
/// and one receive middleware chain.
#[derive(Clone)]
pub struct SubscriptionGroupFactory {
    dispatcher: Arc<dyn Dispatcher>,
    monitor: Arc<dyn Monitor>,
    middlewares: Vec<Arc<dyn ReceiveMiddleware>>,
    attribute_names: Vec<String>,
}

impl SubscriptionGroupFactory {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            monitor: Arc::new(NullMonitor),
            middlewares: Vec::new(),
            attribute_names: vec![ALL_ATTRIBUTES.to_string()],
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Appends a receive middleware. Middlewares run in the order they were added.
    pub fn with_middleware(mut self, middleware: Arc<dyn ReceiveMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Message attributes requested on every fetch. Defaults to all of them.
    pub fn with_attribute_names(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.attribute_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Builds a group out of `settings`: one receive buffer per queue feeding a single multiplexer,
    /// read by `concurrency_limit` consumers.
    pub async fn create_group(&self, settings: SubscriptionGroupSettings) -> SubscriptionGroup {
        let config = ReceiveBufferConfig {
            buffer_size: settings.buffer_size(),
            prefetch: settings.prefetch(),
            read_timeout: settings.receive_buffer_read_timeout(),
            wait_time: settings.receive_messages_wait_time(),
            attribute_names: self.attribute_names.clone(),
            middlewares: self.middlewares.clone(),
            monitor: Arc::clone(&self.monitor),
        };

        let (buffers, readers): (Vec<_>, Vec<_>) = settings
            .queues()
            .iter()
            .map(|queue| {
                let (buffer, reader) = ReceiveBuffer::new(Arc::clone(queue), config.clone());
                (Arc::new(buffer), reader)
            })
            .unzip();

        let multiplexer = Arc::new(Multiplexer::new(settings.multiplexer_capacity()));
        multiplexer.read_from(readers).await;

        let consumers = (0..settings.concurrency_limit())
            .map(|id| {
                let consumer = Consumer::new(id, settings.name(), Arc::clone(&self.dispatcher));
                Arc::new(consumer)
            })
            .collect();

        tracing::debug!(group = settings.name(), settings = ?settings, "Created subscription group");
        SubscriptionGroup::new(settings, buffers, multiplexer, consumers)
    }

    /// Validates every group in `config` and builds them all. Nothing is built if any group is
    /// invalid.
    pub async fn create(&self, config: &SubscriptionConfig) -> Result<SubscriptionGroupCollection, ConfigError> {
        let settings = config.build()?;

        let mut groups = Vec::with_capacity(settings.len());
        for settings in settings {
            groups.push(self.create_group(settings).await);
        }

        Ok(SubscriptionGroupCollection::new(groups))
    }
}
