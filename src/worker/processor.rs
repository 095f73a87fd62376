use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::messages::{
    CompletionReport, CorrelationMessage, LockedMessage, Outcome, UpdateResult,
};
use crate::domain::ports::{MessageProcessor, RecordUpdater};

/// Performs the deferred work for a correlation id and reports back to the record.
///
/// Holds no state between messages; every call builds the same report for the
/// same id, so a redelivered message produces the same final record state.
pub struct DeferredWorkProcessor {
    updater: Arc<dyn RecordUpdater>,
    work_delay: Duration,
    result_payload: String,
}

impl DeferredWorkProcessor {
    pub fn new(updater: Arc<dyn RecordUpdater>, result_payload: impl Into<String>) -> Self {
        Self {
            updater,
            work_delay: Duration::ZERO,
            result_payload: result_payload.into(),
        }
    }

    /// Simulated processing time spent before reporting back
    pub fn with_work_delay(mut self, work_delay: Duration) -> Self {
        self.work_delay = work_delay;
        self
    }
}

#[async_trait]
impl MessageProcessor for DeferredWorkProcessor {
    async fn process(&self, message: &LockedMessage) -> Outcome {
        let correlation = match CorrelationMessage::from_body(&message.body) {
            Ok(correlation) => correlation,
            Err(e) => {
                // Left on the queue; the broker dead-letters it after its max delivery count.
                warn!(
                    message_id = %message.message_id,
                    delivery_count = message.delivery_count,
                    error = %e,
                    "Undecodable message body"
                );
                return Outcome::retry(e.to_string());
            }
        };

        debug!(
            correlation_id = %correlation.id(),
            delivery_count = message.delivery_count,
            "Processing message"
        );

        if !self.work_delay.is_zero() {
            tokio::time::sleep(self.work_delay).await;
        }

        let report = CompletionReport::completed(correlation.id(), self.result_payload.clone());

        match self.updater.apply(&report).await {
            Ok(UpdateResult::Applied) => {
                info!(correlation_id = %correlation.id(), "Record updated");
                Outcome::CompleteOk
            }
            Ok(UpdateResult::NotFound) => {
                info!(
                    correlation_id = %correlation.id(),
                    "Record no longer exists, nothing to update"
                );
                Outcome::CompleteAbsent
            }
            Err(e) => {
                warn!(
                    correlation_id = %correlation.id(),
                    error = %e,
                    "Record update failed"
                );
                Outcome::retry(e.to_string())
            }
        }
    }
}
