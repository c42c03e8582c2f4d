//! Topic-broker (pub/sub) binding.
//!
//! The adaptor speaks to any substrate through [`PubSubClient`]; the
//! in-process [`MemoryBroker`] implements it for tests and single-process
//! deployments. Delivery is best-effort: sends while no session is live
//! are dropped with an error.

mod client;
pub use client::{PubSubClient, PubSubHandle, PubSubSession, TopicMessage};

mod pubsub_adaptor;
pub use pubsub_adaptor::{PubSubAdaptor, PubSubConfig};

mod memory_broker;
pub use memory_broker::MemoryBroker;
