pub mod messages;
pub mod ports;

pub use messages::{
    CompletionReport, CorrelationMessage, LockedMessage, MessageError, Outcome, UpdateResult,
};
pub use ports::{
    EnqueueError, MessageProcessor, MessageReceiver, MessageSender, QueueError, RecordUpdater,
    TokenError, TokenProvider, UpdateError,
};
