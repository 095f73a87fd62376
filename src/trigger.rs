use std::sync::Arc;

use tracing::{debug, error, info};

use crate::domain::messages::{CorrelationMessage, MessageError};
use crate::domain::ports::{EnqueueError, MessageSender};

/// Errors returned to the caller of [`RecordEventTrigger::on_business_event`]
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Invalid record id: {0}")]
    InvalidRecordId(#[from] MessageError),

    #[error("Failed to enqueue deferred work: {0}")]
    Enqueue(#[from] EnqueueError),
}

/// Entry point for the transactional caller.
///
/// Puts only the record id on the queue and returns once the queue has
/// accepted it. Any failure is handed back so the caller can abort its own
/// unit of work; nothing is retried here.
#[derive(Clone)]
pub struct RecordEventTrigger {
    sender: Arc<dyn MessageSender>,
}

impl RecordEventTrigger {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }

    pub async fn on_business_event(&self, record_id: &str) -> Result<(), TriggerError> {
        let message = CorrelationMessage::new(record_id)?;
        debug!(record_id = %message.id(), "Enqueuing deferred work");

        self.sender.send(&message.to_body()).await.map_err(|e| {
            error!(record_id = %message.id(), error = %e, "Enqueue failed");
            TriggerError::from(e)
        })?;

        info!(record_id = %message.id(), "Deferred work enqueued");
        Ok(())
    }
}
