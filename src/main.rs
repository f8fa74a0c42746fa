use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rust_mq_subscriber::*;
use tokio_util::sync::CancellationToken;

const MESSAGES_PER_QUEUE: usize = 50;

#[tokio::main]
async fn main() {
    let env = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env).init();

    let orders = Arc::new(InMemoryQueue::new("orders"));
    let payments = Arc::new(InMemoryQueue::new("payments"));
    let audit = Arc::new(InMemoryQueue::new("audit"));
    for i in 0..MESSAGES_PER_QUEUE {
        orders.send(format!("order #{i}")).await;
        payments.send(format!("payment #{i}")).await;
        audit.send(format!("audit entry #{i}")).await;
    }

    let config = SubscriptionConfig::new(SubscriptionGroupDefaults {
        receive_messages_wait_time: Duration::from_secs(1),
        ..Default::default()
    })
    .add_queue(Some("checkout"), orders.clone())
    .add_queue(Some("checkout"), payments.clone())
    .add_queue(None, audit.clone())
    .with_group("checkout", |group| group.with_concurrency_limit(4).with_prefetch(5))
    .with_group("audit", |group| group.with_concurrency_limit(1).with_buffer_size(2));

    let cancel = CancellationToken::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = {
        let cancel = cancel.clone();
        let handled = Arc::clone(&handled);
        move |message: MessageHandle, _: CancellationToken| {
            let cancel = cancel.clone();
            let handled = Arc::clone(&handled);
            async move {
                tracing::info!(queue = message.queue_name(), body = %message.message().body, "Handling message");
                tokio::time::sleep(Duration::from_millis(10)).await;
                message.delete().await.map_err(DispatchError::new)?;

                if handled.fetch_add(1, Ordering::AcqRel) + 1 == 3 * MESSAGES_PER_QUEUE {
                    tracing::info!("Every message was handled, shutting down");
                    cancel.cancel();
                }
                Ok::<_, DispatchError>(())
            }
        }
    };

    let factory = SubscriptionGroupFactory::new(Arc::new(dispatcher))
        .with_monitor(Arc::new(TracingMonitor))
        .with_middleware(Arc::new(ReceiveTracing));

    let groups = match factory.create(&config).await {
        Ok(groups) => groups,
        Err(e) => {
            tracing::error!(error = %e, "Invalid subscription settings");
            std::process::exit(1);
        }
    };

    let completion = groups.run(cancel.clone());
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    let res = completion.await;
    for group in groups.interrogate() {
        println!("{group:#?}");
    }

    if let Err(e) = res {
        tracing::error!(error = %e, "Subscription groups failed");
        std::process::exit(1);
    }
}
