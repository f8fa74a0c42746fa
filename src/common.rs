use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::consumer::Dispatcher;
use crate::error::DispatchError;
use crate::message::{ALL_ATTRIBUTES, MessageHandle, ReceiveRequest};

pub(crate) type LogConfig = tracing_subscriber::fmt::SubscriberBuilder<
    tracing_subscriber::fmt::format::DefaultFields,
    tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Full, ()>,
    tracing_subscriber::EnvFilter,
>;

#[rstest::fixture]
pub(crate) fn log_conf() -> LogConfig {
    let env = tracing_subscriber::EnvFilter::from_default_env();
    tracing_subscriber::fmt::Subscriber::builder().with_env_filter(env).without_time()
}

#[rstest::fixture]
pub(crate) fn log_stdout(log_conf: LogConfig) {
    let _ = log_conf.with_test_writer().try_init();
}

/// A fetch request which never long-polls.
pub(crate) fn request(max_messages: usize) -> ReceiveRequest {
    ReceiveRequest { max_messages, wait_time: Duration::ZERO, attribute_names: vec![ALL_ATTRIBUTES.to_string()] }
}

/// Records the id of every message it is handed, optionally failing on one of them.
#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    ids: Mutex<Vec<String>>,
    fail_on: Option<String>,
    delete: bool,
}

impl RecordingDispatcher {
    pub(crate) fn failing_on(id: &str) -> Self {
        Self { fail_on: Some(id.to_string()), ..Default::default() }
    }

    /// Deletes every message from its queue once recorded.
    pub(crate) fn deleting() -> Self {
        Self { delete: true, ..Default::default() }
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.ids.lock().expect("Poisoned").clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.ids.lock().expect("Poisoned").len()
    }

    /// Waits until at least `n` messages have been recorded.
    pub(crate) async fn wait_for(self: &Arc<Self>, n: usize) {
        while self.count() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait::async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: MessageHandle, _cancel: CancellationToken) -> Result<(), DispatchError> {
        self.ids.lock().expect("Poisoned").push(message.id().to_string());

        if self.fail_on.as_deref() == Some(message.id()) {
            return Err(DispatchError::new(format!("refusing to handle {}", message.id())));
        }
        if self.delete {
            message.delete().await.map_err(DispatchError::new)?;
        }
        Ok(())
    }
}
