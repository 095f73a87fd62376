pub mod memory_queue;
pub mod record_store;
pub mod servicebus;

pub use memory_queue::InMemoryQueue;
