use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// One message consumed from a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub payload: Bytes,
}

/// An established broker session.
///
/// `deliveries` closing signals disconnection; queue and binding state is
/// re-derived on the next session.
pub struct QueueSession {
    pub handle: Arc<dyn QueueHandle>,
    pub deliveries: mpsc::Receiver<Delivery>,
}

/// Operations valid on a live session.
///
/// Publishing with an empty exchange routes directly to the queue named by
/// the routing key.
#[async_trait]
pub trait QueueHandle: Send + Sync {
    async fn declare_queue(&self, queue: &str) -> Result<()>;
    async fn bind(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()>;
    async fn consume(&self, queue: &str) -> Result<()>;
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()>;
}

/// Connection factory for a queue-broker substrate.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<QueueSession>;
}
