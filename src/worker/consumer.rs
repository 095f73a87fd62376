use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry_strategy::RetryStrategy;
use crate::domain::messages::{LockedMessage, Outcome};
use crate::domain::ports::{MessageProcessor, MessageReceiver, QueueError};

/// What happened to a message after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Effect confirmed and message removed from the queue
    Completed,

    /// Effect confirmed but the complete call failed; the lock will expire and
    /// the message will be redelivered
    CompleteFailed,

    /// Processing failed; message left locked until the lock expires
    LeftLocked,

    /// Processing failed; lock released after backoff
    Abandoned,
}

/// Errors that stop the receive loop
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Unrecoverable queue error: {0}")]
    Transport(#[from] QueueError),

    #[error("Worker pool closed")]
    PoolClosed,
}

/// Receive loop: receive → process → complete, one message per permit.
///
/// With `max_in_flight == 1` messages are handled strictly one after another.
/// A permit is taken before each receive, so the loop never holds a lock on a
/// message it has no capacity to process.
pub struct QueueConsumer {
    receiver: Arc<dyn MessageReceiver>,
    processor: Arc<dyn MessageProcessor>,
    max_in_flight: usize,
    backoff: RetryStrategy,
    abandon_on_failure: bool,
}

impl QueueConsumer {
    pub fn new(receiver: Arc<dyn MessageReceiver>, processor: Arc<dyn MessageProcessor>) -> Self {
        Self {
            receiver,
            processor,
            max_in_flight: 1,
            backoff: RetryStrategy::default_strategy(),
            abandon_on_failure: false,
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: RetryStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Unlock failed messages after a backoff instead of waiting for lock expiry
    pub fn with_abandon_on_failure(mut self, abandon_on_failure: bool) -> Self {
        self.abandon_on_failure = abandon_on_failure;
        self
    }

    /// Run until cancelled or until the queue reports an unrecoverable error.
    ///
    /// In-flight messages are always allowed to finish before returning.
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), ConsumerError> {
        info!(max_in_flight = self.max_in_flight, "Starting consumer loop");

        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight = JoinSet::new();
        let mut consecutive_failures = 0u32;

        let result = loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            let permit = tokio::select! {
                _ = ctx.cancelled() => break Ok(()),
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(ConsumerError::PoolClosed),
                },
            };

            let received = tokio::select! {
                _ = ctx.cancelled() => break Ok(()),
                received = self.receiver.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    consecutive_failures = 0;
                    debug!(
                        message_id = %message.message_id,
                        delivery_count = message.delivery_count,
                        "Received message"
                    );

                    let receiver = self.receiver.clone();
                    let processor = self.processor.clone();
                    let backoff = self.backoff.clone();
                    let abandon = self.abandon_on_failure;

                    in_flight.spawn(async move {
                        let disposition =
                            Self::handle_message(message, receiver, processor, &backoff, abandon)
                                .await;
                        drop(permit);
                        disposition
                    });
                }
                Ok(None) => {
                    consecutive_failures = 0;
                    debug!("No message available");
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Unrecoverable receive error, stopping consumer");
                    break Err(ConsumerError::Transport(e));
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = self.backoff.next_delay(consecutive_failures);
                    warn!(
                        error = %e,
                        consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Receive failed, backing off"
                    );

                    tokio::select! {
                        _ = ctx.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight messages");
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }

        info!("Consumer stopped");
        result
    }

    /// Process one message and settle it according to the outcome.
    ///
    /// `complete` is only issued for this message and only after its effect was
    /// confirmed (applied, or moot because the target is gone).
    pub async fn handle_message(
        message: LockedMessage,
        receiver: Arc<dyn MessageReceiver>,
        processor: Arc<dyn MessageProcessor>,
        backoff: &RetryStrategy,
        abandon_on_failure: bool,
    ) -> Disposition {
        let outcome = processor.process(&message).await;

        match outcome {
            Outcome::CompleteOk | Outcome::CompleteAbsent => {
                match receiver.complete(&message).await {
                    Ok(()) => {
                        info!(
                            message_id = %message.message_id,
                            outcome = ?outcome,
                            "Message completed"
                        );
                        Disposition::Completed
                    }
                    Err(e) => {
                        // The update is idempotent, so a redelivery is harmless.
                        warn!(
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to complete message, it will be redelivered"
                        );
                        Disposition::CompleteFailed
                    }
                }
            }
            Outcome::Retry { reason } => {
                warn!(
                    message_id = %message.message_id,
                    delivery_count = message.delivery_count,
                    reason = %reason,
                    "Processing failed, message left for redelivery"
                );

                if !abandon_on_failure {
                    return Disposition::LeftLocked;
                }

                tokio::time::sleep(backoff.next_delay(message.delivery_count)).await;
                match receiver.abandon(&message).await {
                    Ok(()) => Disposition::Abandoned,
                    Err(e) => {
                        warn!(
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to abandon message, waiting for lock expiry"
                        );
                        Disposition::LeftLocked
                    }
                }
            }
        }
    }
}

fn log_join(joined: Result<Disposition, tokio::task::JoinError>) {
    match joined {
        Ok(disposition) => debug!(?disposition, "Message handling finished"),
        Err(e) => error!(error = %e, "Message handling task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::MessageSender;
    use crate::outbound::memory_queue::InMemoryQueue;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Processor double returning scripted outcomes, then `CompleteOk`
    struct ScriptedProcessor {
        outcomes: Mutex<VecDeque<Outcome>>,
        seen: Mutex<Vec<(String, u32)>>,
    }

    impl ScriptedProcessor {
        fn new(outcomes: Vec<Outcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageProcessor for ScriptedProcessor {
        async fn process(&self, message: &LockedMessage) -> Outcome {
            self.seen.lock().await.push((
                String::from_utf8_lossy(&message.body).to_string(),
                message.delivery_count,
            ));
            self.outcomes
                .lock()
                .await
                .pop_front()
                .unwrap_or(Outcome::CompleteOk)
        }
    }

    /// Receiver that always fails with the given error
    struct BrokenReceiver {
        fatal: bool,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl MessageReceiver for BrokenReceiver {
        async fn receive(&self) -> Result<Option<LockedMessage>, QueueError> {
            *self.calls.lock().await += 1;
            if self.fatal {
                Err(QueueError::EntityNotFound("samplequeue".to_string()))
            } else {
                Err(QueueError::Transport("connection reset".to_string()))
            }
        }

        async fn complete(&self, _message: &LockedMessage) -> Result<(), QueueError> {
            Ok(())
        }

        async fn abandon(&self, _message: &LockedMessage) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn queue() -> Arc<InMemoryQueue> {
        Arc::new(InMemoryQueue::with_timings(
            Duration::from_secs(30),
            Duration::from_millis(20),
        ))
    }

    #[tokio::test]
    async fn test_complete_ok_removes_message() {
        let queue = queue();
        queue.send(b"abc-123").await.unwrap();
        let message = queue.receive().await.unwrap().unwrap();

        let processor = Arc::new(ScriptedProcessor::new(vec![Outcome::CompleteOk]));
        let disposition = QueueConsumer::handle_message(
            message,
            queue.clone(),
            processor,
            &RetryStrategy::new(1, 1),
            false,
        )
        .await;

        assert_eq!(disposition, Disposition::Completed);
        assert!(queue.is_empty().await);
        assert_eq!(queue.completed_count().await, 1);
    }

    #[tokio::test]
    async fn test_complete_absent_removes_message() {
        let queue = queue();
        queue.send(b"abc-123").await.unwrap();
        let message = queue.receive().await.unwrap().unwrap();

        let processor = Arc::new(ScriptedProcessor::new(vec![Outcome::CompleteAbsent]));
        let disposition = QueueConsumer::handle_message(
            message,
            queue.clone(),
            processor,
            &RetryStrategy::new(1, 1),
            false,
        )
        .await;

        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(queue.completed_count().await, 1);
    }

    #[tokio::test]
    async fn test_retry_leaves_message_locked() {
        let queue = queue();
        queue.send(b"abc-123").await.unwrap();
        let message = queue.receive().await.unwrap().unwrap();

        let processor = Arc::new(ScriptedProcessor::new(vec![Outcome::retry("500")]));
        let disposition = QueueConsumer::handle_message(
            message,
            queue.clone(),
            processor,
            &RetryStrategy::new(1, 1),
            false,
        )
        .await;

        assert_eq!(disposition, Disposition::LeftLocked);
        assert_eq!(queue.locked_len().await, 1);
        assert_eq!(queue.completed_count().await, 0);
    }

    #[tokio::test]
    async fn test_retry_with_abandon_releases_lock() {
        let queue = queue();
        queue.send(b"abc-123").await.unwrap();
        let message = queue.receive().await.unwrap().unwrap();

        let processor = Arc::new(ScriptedProcessor::new(vec![Outcome::retry("500")]));
        let disposition = QueueConsumer::handle_message(
            message,
            queue.clone(),
            processor,
            &RetryStrategy::new(1, 1),
            true,
        )
        .await;

        assert_eq!(disposition, Disposition::Abandoned);
        assert_eq!(queue.visible_len().await, 1);
    }

    #[tokio::test]
    async fn test_complete_with_lost_lock_is_reported() {
        let queue = queue();
        queue.send(b"abc-123").await.unwrap();
        let message = queue.receive().await.unwrap().unwrap();
        queue.expire_locks().await;

        let processor = Arc::new(ScriptedProcessor::new(vec![Outcome::CompleteOk]));
        let disposition = QueueConsumer::handle_message(
            message,
            queue.clone(),
            processor,
            &RetryStrategy::new(1, 1),
            false,
        )
        .await;

        assert_eq!(disposition, Disposition::CompleteFailed);
        assert_eq!(queue.visible_len().await, 1);
    }

    #[tokio::test]
    async fn test_fail_then_succeed_completes_exactly_once() {
        let queue = queue();
        queue.send(b"abc-123").await.unwrap();

        let processor = Arc::new(ScriptedProcessor::new(vec![Outcome::retry("500")]));
        let consumer = QueueConsumer::new(queue.clone(), processor.clone())
            .with_backoff(RetryStrategy::new(1, 1))
            .with_abandon_on_failure(true);

        let ctx = CancellationToken::new();
        let run_ctx = ctx.clone();
        let handle = tokio::spawn(async move { consumer.run(run_ctx).await });

        for _ in 0..100 {
            if queue.completed_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(queue.completed_count().await, 1);
        assert!(queue.is_empty().await);

        let seen = processor.seen.lock().await.clone();
        assert_eq!(
            seen,
            vec![("abc-123".to_string(), 1), ("abc-123".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_lock_expiry_redelivers_after_failure() {
        let queue = Arc::new(InMemoryQueue::with_timings(
            Duration::from_millis(30),
            Duration::from_millis(10),
        ));
        queue.send(b"abc-123").await.unwrap();

        let processor = Arc::new(ScriptedProcessor::new(vec![Outcome::retry("500")]));
        let consumer = QueueConsumer::new(queue.clone(), processor.clone());

        let ctx = CancellationToken::new();
        let run_ctx = ctx.clone();
        let handle = tokio::spawn(async move { consumer.run(run_ctx).await });

        for _ in 0..200 {
            if queue.completed_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(queue.completed_count().await, 1);
        assert_eq!(processor.seen.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_workers_process_all_messages() {
        let queue = queue();
        for i in 0..10 {
            queue.send(format!("rec-{i}").as_bytes()).await.unwrap();
        }

        let processor = Arc::new(ScriptedProcessor::new(vec![]));
        let consumer = QueueConsumer::new(queue.clone(), processor.clone()).with_max_in_flight(4);

        let ctx = CancellationToken::new();
        let run_ctx = ctx.clone();
        let handle = tokio::spawn(async move { consumer.run(run_ctx).await });

        for _ in 0..100 {
            if queue.completed_count().await == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(queue.completed_count().await, 10);
        let mut seen: Vec<String> = processor
            .seen
            .lock()
            .await
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn test_fatal_receive_error_stops_loop() {
        let receiver = Arc::new(BrokenReceiver {
            fatal: true,
            calls: Mutex::new(0),
        });
        let consumer =
            QueueConsumer::new(receiver.clone(), Arc::new(ScriptedProcessor::new(vec![])));

        let result = consumer.run(CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(ConsumerError::Transport(QueueError::EntityNotFound(_)))
        ));
        assert_eq!(*receiver.calls.lock().await, 1);
    }

    #[tokio::test]
    async fn test_transient_receive_errors_keep_polling() {
        let receiver = Arc::new(BrokenReceiver {
            fatal: false,
            calls: Mutex::new(0),
        });
        let consumer =
            QueueConsumer::new(receiver.clone(), Arc::new(ScriptedProcessor::new(vec![])))
                .with_backoff(RetryStrategy::new(1, 2));

        let ctx = CancellationToken::new();
        let run_ctx = ctx.clone();
        let handle = tokio::spawn(async move { consumer.run(run_ctx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.cancel();

        assert!(handle.await.unwrap().is_ok());
        assert!(*receiver.calls.lock().await > 3);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_in_flight_message() {
        struct SlowProcessor;

        #[async_trait]
        impl MessageProcessor for SlowProcessor {
            async fn process(&self, _message: &LockedMessage) -> Outcome {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Outcome::CompleteOk
            }
        }

        let queue = queue();
        queue.send(b"abc-123").await.unwrap();

        let consumer = QueueConsumer::new(queue.clone(), Arc::new(SlowProcessor));
        let ctx = CancellationToken::new();
        let run_ctx = ctx.clone();
        let handle = tokio::spawn(async move { consumer.run(run_ctx).await });

        while queue.locked_len().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(queue.completed_count().await, 1);
    }
}
