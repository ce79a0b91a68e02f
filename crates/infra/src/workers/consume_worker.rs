use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowbridge_core::BridgeError;
use flowbridge_messaging::{BrokerConsumer, BrokerMessage, MessageBroker};

use super::handle::WorkerHandle;

/// Per-message logic of a consume loop.
///
/// `Ok` commits the message. `Err` leaves it uncommitted: the loop drops its
/// group membership and re-subscribes, so the broker redelivers it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: &BrokerMessage) -> Result<(), BridgeError>;

    /// Called when a consume wait elapsed without a message.
    async fn on_idle(&self) {}
}

#[derive(Debug, Clone)]
pub struct ConsumeWorkerConfig {
    pub name: String,
    pub topic: String,
    pub group: String,
    /// Upper bound of one consume wait; also the cancellation latency.
    pub poll_timeout: Duration,
    /// Delay before re-subscribing after a broker error.
    pub retry_delay: Duration,
}

impl ConsumeWorkerConfig {
    pub fn new(name: impl Into<String>, topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            group: group.into(),
            poll_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Generic broker consume loop.
///
/// - One message at a time, in channel order
/// - Manual commit after the handler returns `Ok`
/// - Shutdown observed between messages and during every consume wait; a
///   message already being handled is finished first
#[derive(Debug)]
pub struct ConsumeWorker;

impl ConsumeWorker {
    pub fn spawn(
        config: ConsumeWorkerConfig,
        broker: Arc<dyn MessageBroker>,
        handler: Arc<dyn MessageHandler>,
        token: CancellationToken,
    ) -> WorkerHandle {
        let name = config.name.clone();
        let loop_token = token.clone();
        let join = tokio::spawn(async move { worker_loop(config, broker, handler, loop_token).await });
        WorkerHandle::new(name, token, join)
    }
}

enum Exit {
    Cancelled,
    Resubscribe,
}

async fn worker_loop(
    config: ConsumeWorkerConfig,
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn MessageHandler>,
    token: CancellationToken,
) {
    info!(worker = %config.name, topic = %config.topic, group = %config.group, "consume worker started");

    loop {
        let subscribed = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = broker.subscribe(&config.topic, &config.group) => result,
        };

        let mut consumer = match subscribed {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(worker = %config.name, error = %e, "subscribe failed, retrying");
                if sleep_or_cancel(&token, config.retry_delay).await {
                    break;
                }
                continue;
            }
        };

        let exit = consume(&config, consumer.as_mut(), handler.as_ref(), &token).await;
        consumer.close().await;

        match exit {
            Exit::Cancelled => break,
            Exit::Resubscribe => {
                if sleep_or_cancel(&token, config.retry_delay).await {
                    break;
                }
            }
        }
    }

    info!(worker = %config.name, "consume worker stopped");
}

async fn consume(
    config: &ConsumeWorkerConfig,
    consumer: &mut dyn BrokerConsumer,
    handler: &dyn MessageHandler,
    token: &CancellationToken,
) -> Exit {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Exit::Cancelled,
            result = consumer.consume(config.poll_timeout) => result,
        };

        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => {
                handler.on_idle().await;
                continue;
            }
            Err(e) => {
                warn!(worker = %config.name, error = %e, "consume failed, re-subscribing");
                return Exit::Resubscribe;
            }
        };

        if message.delivery_count > 1 {
            debug!(
                worker = %config.name,
                position = %message.position,
                delivery_count = message.delivery_count,
                "redelivered message"
            );
        }

        match handler.on_message(&message).await {
            Ok(()) => {
                if let Err(e) = consumer.commit(&message).await {
                    warn!(worker = %config.name, position = %message.position, error = %e, "commit failed");
                }
            }
            Err(e) => {
                error!(
                    worker = %config.name,
                    position = %message.position,
                    kind = e.kind(),
                    error = %e,
                    "message left uncommitted for redelivery"
                );
                return Exit::Resubscribe;
            }
        }
    }
}

/// Returns `true` when cancelled.
async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flowbridge_messaging::InMemoryBroker;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_message(&self, message: &BrokerMessage) -> Result<(), BridgeError> {
            self.seen.lock().unwrap().push(message.value.clone());
            let failed = self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                Err(BridgeError::transient("resume timed out"))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> ConsumeWorkerConfig {
        ConsumeWorkerConfig::new("test", "t", "g")
            .with_poll_timeout(Duration::from_millis(10))
            .with_retry_delay(Duration::from_millis(10))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn handled_messages_are_committed_in_order() {
        let broker = InMemoryBroker::new();
        broker.produce("t", "a", "1").await.unwrap();
        broker.produce("t", "b", "2").await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let handle = ConsumeWorker::spawn(config(), Arc::new(broker.clone()), recorder.clone(), CancellationToken::new());

        eventually(|| broker.committed_offset("t", "g") == 2).await;
        assert!(handle.shutdown(Duration::from_secs(1)).await);
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn failed_message_is_redelivered_before_later_ones() {
        let broker = InMemoryBroker::new();
        broker.produce("t", "a", "1").await.unwrap();
        broker.produce("t", "b", "2").await.unwrap();

        let recorder = Arc::new(Recorder {
            fail_first: AtomicUsize::new(1),
            ..Default::default()
        });
        let handle = ConsumeWorker::spawn(config(), Arc::new(broker.clone()), recorder.clone(), CancellationToken::new());

        eventually(|| broker.committed_offset("t", "g") == 2).await;
        handle.shutdown(Duration::from_secs(1)).await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["1", "1", "2"]);
    }

    #[tokio::test]
    async fn cancellation_interrupts_an_idle_wait() {
        let broker = InMemoryBroker::new();
        let config = config().with_poll_timeout(Duration::from_secs(3600));
        let handle = ConsumeWorker::spawn(
            config,
            Arc::new(broker),
            Arc::new(Recorder::default()),
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.shutdown(Duration::from_millis(500)).await);
    }
}
