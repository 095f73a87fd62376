// Consumer side of the relay
//
//   consumer       – receive loop with a bounded number of in-flight messages
//   processor      – deferred work and the conditional record update
//   retry_strategy – backoff between failed receives and before unlocking

pub mod consumer;
pub mod processor;
pub mod retry_strategy;

pub use consumer::{ConsumerError, Disposition, QueueConsumer};
pub use processor::DeferredWorkProcessor;
pub use retry_strategy::RetryStrategy;
