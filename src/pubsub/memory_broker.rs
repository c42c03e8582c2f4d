use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{PubSubClient, PubSubHandle, PubSubSession, TopicMessage};
use crate::error::{Error, ErrorKind, Result};

const EVENT_QUEUE: usize = 256;

struct Subscriber {
    client_id: String,
    tx: mpsc::Sender<TopicMessage>,
}

#[derive(Default)]
struct BrokerInner {
    subs: Mutex<HashMap<String, Vec<Subscriber>>>,
    clients: Mutex<HashMap<String, mpsc::Sender<TopicMessage>>>,
}

/// In-process pub/sub substrate with exact-match topics.
///
/// Doubles as the loopback transport and as the broker stand-in in tests:
/// `disconnect` severs one client's session the way a broker-side kick
/// would, which makes reconnect behavior observable.
#[derive(Clone, Default)]
pub struct MemoryBroker(Arc<BrokerInner>);

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Severs `client_id`'s session: its event channel closes and its
    /// subscriptions are dropped.
    pub fn disconnect(&self, client_id: &str) {
        self.0.clients.lock().remove(client_id);
        let mut subs = self.0.subs.lock();
        for subscribers in subs.values_mut() {
            subscribers.retain(|s| s.client_id != client_id);
        }
    }

    /// Number of live subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.0.subs.lock().get(topic).map_or(0, |subscribers| {
            subscribers.iter().filter(|s| !s.tx.is_closed()).count()
        })
    }

    /// Ids of clients whose session is still open.
    #[must_use]
    pub fn client_ids(&self) -> Vec<String> {
        self.0
            .clients
            .lock()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

struct MemoryHandle {
    inner: Arc<BrokerInner>,
    client_id: String,
}

#[async_trait]
impl PubSubHandle for MemoryHandle {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        let tx = self
            .inner
            .clients
            .lock()
            .get(&self.client_id)
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::SubscribeFailed,
                    format!("client {} is not connected", self.client_id),
                )
            })?;
        self.inner
            .subs
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                client_id: self.client_id.clone(),
                tx,
            });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.inner.clients.lock().contains_key(&self.client_id) {
            return Err(Error::new(
                ErrorKind::PublishFailed,
                format!("client {} is not connected", self.client_id),
            ));
        }
        let mut subs = self.inner.subs.lock();
        if let Some(subscribers) = subs.get_mut(topic) {
            subscribers.retain(|s| !s.tx.is_closed());
            for subscriber in subscribers.iter() {
                let message = TopicMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                if subscriber.tx.try_send(message).is_err() {
                    tracing::warn!("dropping message for slow subscriber on {topic}");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubClient for MemoryBroker {
    async fn connect(&self, client_id: &str) -> Result<PubSubSession> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        {
            // sweep sessions whose receiver side is gone, so reconnecting
            // clients do not accumulate dead entries
            let mut clients = self.0.clients.lock();
            clients.retain(|_, tx| !tx.is_closed());
            clients.insert(client_id.to_string(), tx);
        }
        Ok(PubSubSession {
            handle: Arc::new(MemoryHandle {
                inner: self.0.clone(),
                client_id: client_id.to_string(),
            }),
            events: rx,
        })
    }
}
