//! Two-level subscription configuration: one set of [defaults] shared by every group, overridden
//! field by field by each [group builder]. Building merges both levels and validates the result,
//! which is then immutable.
//!
//! Validation never clamps: a value outside of what the queue provider accepts is a [`ConfigError`]
//! and the pipeline does not start.
//!
//! [defaults]: SubscriptionGroupDefaults
//! [group builder]: SubscriptionGroupConfigBuilder

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::message::QueueAdapter;

/// The most messages a provider returns from a single receive call.
pub const MAX_PREFETCH: usize = 10;

/// The longest a provider holds a receive call open when long polling.
pub const MAX_RECEIVE_WAIT_TIME: Duration = Duration::from_secs(20);

/// Settings shared by every subscription group unless overridden.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionGroupDefaults {
    /// Consumers per group.
    pub concurrency_limit: usize,
    /// Capacity of each queue's receive buffer.
    pub buffer_size: usize,
    pub receive_buffer_read_timeout: Duration,
    pub receive_messages_wait_time: Duration,
    /// Capacity of the channel shared by a group's consumers.
    pub multiplexer_capacity: usize,
    pub prefetch: usize,
}

impl Default for SubscriptionGroupDefaults {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, usize::from);
        Self {
            concurrency_limit: 4 * cores,
            buffer_size: 10,
            receive_buffer_read_timeout: Duration::from_secs(5 * 60),
            receive_messages_wait_time: MAX_RECEIVE_WAIT_TIME,
            multiplexer_capacity: 100,
            prefetch: 10,
        }
    }
}

/// Overrides for one named subscription group, along with the queues it reads from.
#[derive(Clone, Default)]
pub struct SubscriptionGroupConfigBuilder {
    name: String,
    concurrency_limit: Option<usize>,
    buffer_size: Option<usize>,
    receive_buffer_read_timeout: Option<Duration>,
    receive_messages_wait_time: Option<Duration>,
    multiplexer_capacity: Option<usize>,
    prefetch: Option<usize>,
    queues: Vec<Arc<dyn QueueAdapter>>,
}

impl std::fmt::Debug for SubscriptionGroupConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGroupConfigBuilder")
            .field("name", &self.name)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("buffer_size", &self.buffer_size)
            .field("receive_buffer_read_timeout", &self.receive_buffer_read_timeout)
            .field("receive_messages_wait_time", &self.receive_messages_wait_time)
            .field("multiplexer_capacity", &self.multiplexer_capacity)
            .field("prefetch", &self.prefetch)
            .field("queues", &queue_names(&self.queues))
            .finish()
    }
}

impl SubscriptionGroupConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_concurrency_limit(mut self, concurrency_limit: usize) -> Self {
        self.concurrency_limit = Some(concurrency_limit);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    pub fn with_receive_buffer_read_timeout(mut self, timeout: Duration) -> Self {
        self.receive_buffer_read_timeout = Some(timeout);
        self
    }

    pub fn with_receive_messages_wait_time(mut self, wait_time: Duration) -> Self {
        self.receive_messages_wait_time = Some(wait_time);
        self
    }

    pub fn with_multiplexer_capacity(mut self, capacity: usize) -> Self {
        self.multiplexer_capacity = Some(capacity);
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn add_queue(mut self, queue: Arc<dyn QueueAdapter>) -> Self {
        self.queues.push(queue);
        self
    }

    /// Merges these overrides over `defaults` and validates the result.
    pub fn build(&self, defaults: &SubscriptionGroupDefaults) -> Result<SubscriptionGroupSettings, ConfigError> {
        let settings = SubscriptionGroupSettings {
            name: self.name.clone(),
            concurrency_limit: self.concurrency_limit.unwrap_or(defaults.concurrency_limit),
            buffer_size: self.buffer_size.unwrap_or(defaults.buffer_size),
            receive_buffer_read_timeout: self
                .receive_buffer_read_timeout
                .unwrap_or(defaults.receive_buffer_read_timeout),
            receive_messages_wait_time: self.receive_messages_wait_time.unwrap_or(defaults.receive_messages_wait_time),
            multiplexer_capacity: self.multiplexer_capacity.unwrap_or(defaults.multiplexer_capacity),
            prefetch: self.prefetch.unwrap_or(defaults.prefetch),
            queues: self.queues.clone(),
        };

        settings.validate()?;
        Ok(settings)
    }
}

/// The validated settings of one subscription group. Immutable once built.
#[derive(Clone)]
pub struct SubscriptionGroupSettings {
    name: String,
    concurrency_limit: usize,
    buffer_size: usize,
    receive_buffer_read_timeout: Duration,
    receive_messages_wait_time: Duration,
    multiplexer_capacity: usize,
    prefetch: usize,
    queues: Vec<Arc<dyn QueueAdapter>>,
}

impl std::fmt::Debug for SubscriptionGroupSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGroupSettings")
            .field("name", &self.name)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("buffer_size", &self.buffer_size)
            .field("receive_buffer_read_timeout", &self.receive_buffer_read_timeout)
            .field("receive_messages_wait_time", &self.receive_messages_wait_time)
            .field("multiplexer_capacity", &self.multiplexer_capacity)
            .field("prefetch", &self.prefetch)
            .field("queues", &queue_names(&self.queues))
            .finish()
    }
}

impl SubscriptionGroupSettings {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn receive_buffer_read_timeout(&self) -> Duration {
        self.receive_buffer_read_timeout
    }

    pub fn receive_messages_wait_time(&self) -> Duration {
        self.receive_messages_wait_time
    }

    pub fn multiplexer_capacity(&self) -> usize {
        self.multiplexer_capacity
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    pub fn queues(&self) -> &[Arc<dyn QueueAdapter>] {
        &self.queues
    }

    /// Checks every value against the limits of the pipeline and of the queue provider.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let group = || self.name.clone();
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues { group: group() });
        }
        if self.prefetch > MAX_PREFETCH {
            return Err(ConfigError::PrefetchOutOfRange { group: group(), prefetch: self.prefetch, max: MAX_PREFETCH });
        }
        if self.receive_messages_wait_time > MAX_RECEIVE_WAIT_TIME {
            return Err(ConfigError::WaitTimeOutOfRange {
                group: group(),
                wait: self.receive_messages_wait_time,
                max: MAX_RECEIVE_WAIT_TIME,
            });
        }

        for (field, value) in [
            ("concurrency_limit", self.concurrency_limit),
            ("buffer_size", self.buffer_size),
            ("multiplexer_capacity", self.multiplexer_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity { group: group(), field });
            }
        }

        Ok(())
    }
}

/// Defaults plus every named group, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionConfig {
    defaults: SubscriptionGroupDefaults,
    groups: BTreeMap<String, SubscriptionGroupConfigBuilder>,
}

impl SubscriptionConfig {
    pub fn new(defaults: SubscriptionGroupDefaults) -> Self {
        Self { defaults, groups: BTreeMap::new() }
    }

    pub fn defaults(&self) -> &SubscriptionGroupDefaults {
        &self.defaults
    }

    /// Configures the overrides of group `name`, creating it if needed.
    pub fn with_group(
        mut self,
        name: &str,
        configure: impl FnOnce(SubscriptionGroupConfigBuilder) -> SubscriptionGroupConfigBuilder,
    ) -> Self {
        let builder = self.groups.remove(name).unwrap_or_else(|| SubscriptionGroupConfigBuilder::new(name));
        self.groups.insert(name.to_string(), configure(builder));
        self
    }

    /// Adds `queue` to group `group`. A queue without a group gets one of its own, named after it.
    pub fn add_queue(self, group: Option<&str>, queue: Arc<dyn QueueAdapter>) -> Self {
        let name = group.unwrap_or(queue.name()).to_string();
        self.with_group(&name, |builder| builder.add_queue(queue))
    }

    /// Builds the settings of every group, failing on the first invalid one.
    pub fn build(&self) -> Result<Vec<SubscriptionGroupSettings>, ConfigError> {
        self.groups.values().map(|builder| builder.build(&self.defaults)).collect()
    }
}

fn queue_names(queues: &[Arc<dyn QueueAdapter>]) -> Vec<&str> {
    queues.iter().map(|queue| queue.name()).collect()
}
