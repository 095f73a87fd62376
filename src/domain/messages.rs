use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Error raised when a queue body cannot be turned into a correlation message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Message body does not contain a correlation id")]
    EmptyId,

    #[error("Correlation id contains characters outside [A-Za-z0-9_-]: {0:?}")]
    InvalidId(String),
}

/// The minimal payload put on the queue: the primary key of the originating record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationMessage {
    id: String,
}

impl CorrelationMessage {
    /// Create a correlation message from a record id.
    ///
    /// Ids end up in a record URL path, so only ASCII letters, digits, `-` and
    /// `_` are accepted (record keys are GUIDs).
    pub fn new(id: &str) -> Result<Self, MessageError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(MessageError::EmptyId);
        }
        if !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(MessageError::InvalidId(id.to_string()));
        }

        Ok(Self { id: id.to_string() })
    }

    /// Decode a message from the raw queue body
    pub fn from_body(body: &[u8]) -> Result<Self, MessageError> {
        let text = std::str::from_utf8(body).map_err(|_| MessageError::InvalidUtf8)?;
        Self::new(text)
    }

    /// Raw bytes sent as the queue body
    pub fn to_body(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// A message received under a peek-lock.
///
/// The envelope is owned by the consumer for the duration of one receive; the
/// lock token is what identifies this particular delivery to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedMessage {
    pub message_id: String,

    pub lock_token: String,

    /// Number of times the broker has handed this message out, including this one
    pub delivery_count: u32,

    pub sequence_number: Option<i64>,

    pub locked_until: Option<OffsetDateTime>,

    pub body: Vec<u8>,
}

impl LockedMessage {
    pub fn new(message_id: String, lock_token: String, delivery_count: u32, body: Vec<u8>) -> Self {
        Self {
            message_id,
            lock_token,
            delivery_count,
            sequence_number: None,
            locked_until: None,
            body,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn with_locked_until(mut self, locked_until: OffsetDateTime) -> Self {
        self.locked_until = Some(locked_until);
        self
    }

    /// Whether the broker has handed this message out before
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Outcome written back to the originating record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub correlation_id: String,

    pub completed: bool,

    pub result: String,
}

impl CompletionReport {
    /// Report that the deferred work finished with the given result
    pub fn completed(correlation_id: &str, result: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            completed: true,
            result: result.into(),
        }
    }
}

/// Result of applying a [`CompletionReport`] to the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Applied,

    /// The record no longer exists upstream
    NotFound,
}

/// Classification of a processed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The update was applied; the message can be removed
    CompleteOk,

    /// The target record is gone; nothing left to do, the message can be removed
    CompleteAbsent,

    /// The effect is unconfirmed; the message must stay on the queue
    Retry { reason: String },
}

impl Outcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
        }
    }

    pub fn should_complete(&self) -> bool {
        matches!(self, Outcome::CompleteOk | Outcome::CompleteAbsent)
    }
}
