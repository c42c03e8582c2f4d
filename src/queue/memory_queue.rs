use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Delivery, QueueClient, QueueHandle, QueueSession};
use crate::error::{Error, ErrorKind, Result};

const DELIVERY_QUEUE: usize = 256;

struct Consumer {
    client_id: String,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    buffered: VecDeque<Bytes>,
    consumers: Vec<Consumer>,
    rr: usize,
}

#[derive(Default)]
struct QueueInner {
    queues: Mutex<HashMap<String, QueueState>>,
    // exchange -> [(binding key, queue)]
    bindings: Mutex<HashMap<String, Vec<(String, String)>>>,
    clients: Mutex<HashMap<String, mpsc::Sender<Delivery>>>,
}

/// In-process queue substrate with exact-match bindings.
///
/// Messages published to a queue with no live consumer are buffered and
/// handed to the first consumer that shows up; competing consumers on one
/// queue receive round-robin. `disconnect` severs one client the way a
/// broker-side connection loss would.
#[derive(Clone, Default)]
pub struct MemoryQueue(Arc<QueueInner>);

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disconnect(&self, client_id: &str) {
        self.0.clients.lock().remove(client_id);
        let mut queues = self.0.queues.lock();
        for state in queues.values_mut() {
            state.consumers.retain(|c| c.client_id != client_id);
        }
    }

    /// Number of messages sitting in `queue` with no consumer.
    #[must_use]
    pub fn depth(&self, queue: &str) -> usize {
        self.0
            .queues
            .lock()
            .get(queue)
            .map_or(0, |state| state.buffered.len())
    }
}

impl QueueInner {
    fn deliver(&self, queue_name: &str, payload: Bytes) {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue_name.to_string()).or_default();
        state.consumers.retain(|c| !c.tx.is_closed());
        if state.consumers.is_empty() {
            state.buffered.push_back(payload);
            return;
        }
        state.rr = (state.rr + 1) % state.consumers.len();
        let consumer = &state.consumers[state.rr];
        let delivery = Delivery {
            queue: queue_name.to_string(),
            payload,
        };
        if let Err(e) = consumer.tx.try_send(delivery) {
            if let mpsc::error::TrySendError::Full(delivery) = e {
                state.buffered.push_back(delivery.payload);
            }
        }
    }
}

struct MemoryHandle {
    inner: Arc<QueueInner>,
    client_id: String,
}

impl MemoryHandle {
    fn client_tx(&self) -> Result<mpsc::Sender<Delivery>> {
        self.inner
            .clients
            .lock()
            .get(&self.client_id)
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NotConnected,
                    format!("client {} is not connected", self.client_id),
                )
            })
    }
}

#[async_trait]
impl QueueHandle for MemoryHandle {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.client_tx()?;
        self.inner.queues.lock().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        self.client_tx()?;
        let mut bindings = self.inner.bindings.lock();
        let entries = bindings.entry(exchange.to_string()).or_default();
        let entry = (binding_key.to_string(), queue.to_string());
        if !entries.contains(&entry) {
            entries.push(entry);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<()> {
        let tx = self.client_tx()?;
        let mut queues = self.inner.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        // hand over anything that piled up while nobody consumed
        while let Some(payload) = state.buffered.pop_front() {
            let delivery = Delivery {
                queue: queue.to_string(),
                payload,
            };
            if let Err(mpsc::error::TrySendError::Full(delivery)) = tx.try_send(delivery) {
                state.buffered.push_front(delivery.payload);
                break;
            }
        }
        state.consumers.push(Consumer {
            client_id: self.client_id.clone(),
            tx,
        });
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        self.client_tx().map_err(|_| {
            Error::new(
                ErrorKind::PublishFailed,
                format!("client {} is not connected", self.client_id),
            )
        })?;
        if exchange.is_empty() {
            self.inner.deliver(routing_key, payload);
            return Ok(());
        }
        let targets: Vec<String> = {
            let bindings = self.inner.bindings.lock();
            bindings
                .get(exchange)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|(key, _)| key == routing_key)
                        .map(|(_, queue)| queue.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for queue in targets {
            self.inner.deliver(&queue, payload.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn connect(&self, client_id: &str) -> Result<QueueSession> {
        let (tx, rx) = mpsc::channel(DELIVERY_QUEUE);
        {
            // sweep sessions whose receiver side is gone, so reconnecting
            // clients do not accumulate dead entries
            let mut clients = self.0.clients.lock();
            clients.retain(|_, tx| !tx.is_closed());
            clients.insert(client_id.to_string(), tx);
        }
        Ok(QueueSession {
            handle: Arc::new(MemoryHandle {
                inner: self.0.clone(),
                client_id: client_id.to_string(),
            }),
            deliveries: rx,
        })
    }
}
