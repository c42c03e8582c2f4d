//! Queue-broker binding.
//!
//! The adaptor speaks to any substrate through [`QueueClient`]; the
//! in-process [`MemoryQueue`] implements it for tests and single-process
//! deployments. This is the buffered binding: sends while disconnected
//! wait in a bounded outbox instead of being dropped.

mod client;
pub use client::{Delivery, QueueClient, QueueHandle, QueueSession};

mod queue_adaptor;
pub use queue_adaptor::{QueueAdaptor, QueueConfig};

mod memory_queue;
pub use memory_queue::MemoryQueue;
