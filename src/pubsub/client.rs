use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// One message delivered on a subscribed topic.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// An established broker session.
///
/// `events` closing signals disconnection; the adaptor then drops the
/// handle and asks the client for a fresh session.
pub struct PubSubSession {
    pub handle: Arc<dyn PubSubHandle>,
    pub events: mpsc::Receiver<TopicMessage>,
}

/// Operations valid on a live session.
#[async_trait]
pub trait PubSubHandle: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Connection factory for a pub/sub substrate.
///
/// Each connect attempt receives a fresh client id; a broker that kept
/// per-client state for a dead session sees the replacement as a new
/// client instead of a resumption.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<PubSubSession>;
}
