/*
   This module specifies the seams between the relay core and the outside world:
   the queue transport, the deferred work, the record store and its credentials.
*/

use crate::domain::messages::{CompletionReport, LockedMessage, Outcome, UpdateResult};
use async_trait::async_trait;

/// Error type for putting a message on the queue
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Queue rejected message: status={status}, body={body}")]
    Rejected { status: u16, body: String },

    #[error("Transport error while enqueuing: {0}")]
    Transport(String),

    #[error("Failed to sign request: {0}")]
    Signing(String),

    #[error("Queue is closed")]
    Closed,
}

/// Error type for receive / complete / abandon operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected status from queue: status={status}, body={body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Queue entity not found: {0}")]
    EntityNotFound(String),

    #[error("Lock lost for message {message_id}")]
    LockLost { message_id: String },

    #[error("Invalid message envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Failed to sign request: {0}")]
    Signing(String),
}

impl QueueError {
    /// Errors the receive loop cannot recover from by polling again
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::EntityNotFound(_) | QueueError::Signing(_))
    }
}

/// Error type for bearer token acquisition
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token request failed: {0}")]
    RequestFailed(String),

    #[error("Token endpoint returned status={status}, body={body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),
}

/// Error type for record store updates
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("Unexpected status from record store: status={status}, body={body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Transport error while updating record: {0}")]
    Transport(String),

    #[error("Failed to acquire access token: {0}")]
    Token(#[from] TokenError),
}

/// Producer side of the queue
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, body: &[u8]) -> Result<(), EnqueueError>;
}

/// Consumer side of the queue, with peek-lock semantics
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Wait for the next message. `Ok(None)` means the poll window elapsed.
    async fn receive(&self) -> Result<Option<LockedMessage>, QueueError>;

    /// Permanently remove a locked message
    async fn complete(&self, message: &LockedMessage) -> Result<(), QueueError>;

    /// Release the lock so the message becomes visible again
    async fn abandon(&self, message: &LockedMessage) -> Result<(), QueueError>;
}

/// Performs the deferred work for one message
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &LockedMessage) -> Outcome;
}

/// Applies completion reports to the originating record
#[async_trait]
pub trait RecordUpdater: Send + Sync {
    async fn apply(&self, report: &CompletionReport) -> Result<UpdateResult, UpdateError>;
}

/// Supplies bearer tokens for the record store API
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, TokenError>;
}
