use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::DropGuard;

use super::{PubSubClient, PubSubHandle, PubSubSession, TopicMessage};
use crate::{
    Envelope, Mode, PeerId, Registry, RoutingRule, TaskSupervisor,
    adaptor::{
        ConsumerTable, DataReceiver, DataSender, MessageConsumer, Pollable, ReplySender,
    },
    deferred::{ConnectionObservers, DeferredJob, DeferredQueue},
    error::{Error, ErrorKind, Result},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    #[serde_inline_default(Duration::from_millis(500))]
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
    #[serde_inline_default(256)]
    pub send_queue: usize,
    #[serde_inline_default(1024)]
    pub deferred_capacity: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(Default::default())).unwrap()
    }
}

#[derive(Default)]
struct TopicState {
    pending: Vec<String>,
    active: HashSet<String>,
}

struct PubSubCore {
    peer: PeerId,
    district: String,
    registry: Arc<Registry>,
    client: Arc<dyn PubSubClient>,
    config: PubSubConfig,
    consumers: ConsumerTable<String>,
    topics: Mutex<TopicState>,
    topic_added: Notify,
    reconnect_requested: Notify,
    reconnect_armed: AtomicBool,
    deferred: DeferredQueue,
    observers: ConnectionObservers,
    out_tx: Mutex<Option<mpsc::Sender<(String, Bytes)>>>,
    supervisor: TaskSupervisor,
    attempt: AtomicU64,
}

/// Topic-broker transport adaptor.
///
/// Poll-driven and best-effort like the gateway binding: publishes attempted
/// while no session is live are dropped with an error. Subscriptions
/// registered at any time take effect on the current session, or on the
/// next one if the link is down, and every topic is re-subscribed after a
/// reconnect.
pub struct PubSubAdaptor {
    core: Arc<PubSubCore>,
}

impl PubSubAdaptor {
    #[must_use]
    pub fn new(
        client: Arc<dyn PubSubClient>,
        config: PubSubConfig,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            core: Arc::new(PubSubCore {
                peer: PeerId::random(),
                district: registry.district().to_string(),
                registry,
                client,
                deferred: DeferredQueue::new(config.deferred_capacity),
                config,
                consumers: ConsumerTable::default(),
                topics: Mutex::default(),
                topic_added: Notify::new(),
                reconnect_requested: Notify::new(),
                reconnect_armed: AtomicBool::new(false),
                observers: ConnectionObservers::default(),
                out_tx: Mutex::new(None),
                supervisor: TaskSupervisor::new(),
                attempt: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn observers(&self) -> &ConnectionObservers {
        &self.core.observers
    }

    /// Abandons the current session and connects again under a fresh
    /// transport client id. No-op while disconnected (the connect loop is
    /// already doing exactly that).
    pub fn reconnect(&self) {
        // arm only against a live session: Notify would store a permit
        // for the next session otherwise
        if self.core.out_tx.lock().is_some() {
            self.core.reconnect_armed.store(true, Ordering::Release);
            self.core.reconnect_requested.notify_one();
        }
    }

    pub fn stop(&self) {
        self.core.supervisor.stop();
    }

    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.core.supervisor.drop_guard()
    }

    pub async fn join(&self) {
        self.core.supervisor.all_stopped().await;
    }
}

impl PubSubCore {
    fn queue_subscribe(&self, topic: String) {
        {
            let mut topics = self.topics.lock();
            if topics.active.contains(&topic) || topics.pending.contains(&topic) {
                return;
            }
            topics.pending.push(topic);
        }
        self.topic_added.notify_one();
    }

    fn try_send(&self, topic: String, wire: Bytes) -> Result<()> {
        let out_tx = self.out_tx.lock();
        let Some(tx) = out_tx.as_ref() else {
            return Err(Error::kind(ErrorKind::NotConnected));
        };
        tx.try_send((topic, wire))
            .map_err(|e| Error::new(ErrorKind::PublishFailed, e.to_string()))
    }

    async fn run(self: Arc<Self>) {
        let guard = self.supervisor.start_task();
        loop {
            let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
            // a fresh client id per attempt, so the broker never treats the
            // replacement connection as a resumed session
            let client_id = format!("{}-{attempt}", self.peer);
            match self.client.connect(&client_id).await {
                Ok(session) => {
                    {
                        let mut topics = self.topics.lock();
                        let active = std::mem::take(&mut topics.active);
                        topics.pending.extend(active);
                    }
                    let (tx, rx) = mpsc::channel(self.config.send_queue);
                    self.reconnect_armed.store(false, Ordering::Release);
                    *self.out_tx.lock() = Some(tx);
                    self.deferred.push(DeferredJob::Connected);
                    tracing::info!("pubsub session {client_id} established");

                    let publish_guard = self.supervisor.start_task();
                    let handle = session.handle.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = publish_guard.stopped() => {}
                            () = Self::publish_loop(handle, rx) => {}
                        }
                    });

                    tokio::select! {
                        () = guard.stopped() => return,
                        r = self.session_loop(session) => {
                            if let Err(e) = r {
                                tracing::error!("pubsub session lost: {e}");
                            }
                        }
                    }
                    *self.out_tx.lock() = None;
                    self.deferred.push(DeferredJob::Disconnected);
                }
                Err(e) => {
                    tracing::error!("pubsub connect failed: {e}");
                    self.deferred.push(DeferredJob::ConnectFailed(e));
                }
            }

            tokio::select! {
                () = guard.stopped() => return,
                () = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }
    }

    async fn publish_loop(handle: Arc<dyn PubSubHandle>, mut rx: mpsc::Receiver<(String, Bytes)>) {
        while let Some((topic, payload)) = rx.recv().await {
            if let Err(e) = handle.publish(&topic, payload).await {
                tracing::error!("publish to {topic} failed: {e}");
            }
        }
    }

    async fn session_loop(self: &Arc<Self>, mut session: PubSubSession) -> Result<()> {
        loop {
            self.flush_subscriptions(session.handle.as_ref()).await;
            tokio::select! {
                () = self.topic_added.notified() => {}
                () = self.reconnect_requested.notified() => {
                    // a permit without the flag is left over from an
                    // earlier session and must not kill this one
                    if self.reconnect_armed.swap(false, Ordering::AcqRel) {
                        return Err(Error::new(
                            ErrorKind::NotConnected,
                            "reconnect requested".to_string(),
                        ));
                    }
                }
                event = session.events.recv() => {
                    let Some(message) = event else {
                        return Err(Error::new(
                            ErrorKind::RecvFailed,
                            "pubsub session closed".to_string(),
                        ));
                    };
                    self.handle_message(message);
                }
            }
        }
    }

    async fn flush_subscriptions(&self, handle: &dyn PubSubHandle) {
        loop {
            let topic = { self.topics.lock().pending.pop() };
            let Some(topic) = topic else { return };
            match handle.subscribe(&topic).await {
                Ok(()) => {
                    tracing::debug!("subscribed to {topic}");
                    self.topics.lock().active.insert(topic);
                }
                Err(e) => {
                    tracing::error!("subscribe to {topic} failed: {e}");
                    // keep it queued for the next session
                    self.topics.lock().pending.push(topic);
                    return;
                }
            }
        }
    }

    fn handle_message(self: &Arc<Self>, message: TopicMessage) {
        let (envelope, inner) = match Envelope::unwrap(message.payload) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!("malformed envelope on {}: {e}", message.topic);
                return;
            }
        };
        let Some(consumer) = self.consumers.route(envelope.mode, &envelope.service_id) else {
            tracing::debug!(
                "no consumer for {} ({:?}) on {}",
                envelope.service_id,
                envelope.mode,
                message.topic
            );
            return;
        };
        let reply: Option<Arc<dyn ReplySender>> = if envelope.mode.expects_reply() {
            Some(Arc::new(PubSubReply { core: self.clone() }))
        } else {
            None
        };
        self.deferred.push(DeferredJob::Message {
            consumer,
            mode: envelope.mode,
            buf: inner,
            reply,
        });
    }
}

struct PubSubReply {
    core: Arc<PubSubCore>,
}

impl ReplySender for PubSubReply {
    fn send_reply(&self, buf: Bytes, dst: PeerId, rule: &RoutingRule) {
        let topic = rule.pubsub.publish_key(&self.core.district, Some(dst));
        if topic.is_empty() {
            tracing::warn!("no publish key for {} return, dropping", rule.service_id);
            return;
        }
        let envelope = Envelope {
            mode: Mode::Return,
            service_id: rule.service_id.clone(),
        };
        let outcome = envelope
            .wrap(&buf)
            .and_then(|wire| self.core.try_send(topic.clone(), wire));
        if let Err(e) = outcome {
            tracing::warn!("pubsub return to {dst} dropped: {e}");
        }
    }
}

impl DataSender for PubSubAdaptor {
    fn peer_id(&self) -> PeerId {
        self.core.peer
    }

    fn register_delegate(
        &self,
        consumer: Arc<dyn MessageConsumer>,
        service_id: &str,
    ) -> Result<()> {
        let rule = self.core.registry.routing_rule(service_id)?;
        self.core
            .consumers
            .set_delegate(service_id.to_string(), consumer);
        // returns come back on a topic scoped to this peer
        let topic = rule.pubsub.subscribe_key(&self.core.district, Some(self.core.peer));
        if !topic.is_empty() {
            self.core.queue_subscribe(topic);
        }
        Ok(())
    }

    fn send(&self, buf: Bytes, mode: Mode, dst: Option<PeerId>, rule: &RoutingRule) -> Result<()> {
        let topic = rule.pubsub.publish_key(&self.core.district, dst);
        if topic.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("no publish key for service {}", rule.service_id),
            ));
        }
        let envelope = Envelope {
            mode,
            service_id: rule.service_id.clone(),
        };
        let wire = envelope.wrap(&buf)?;
        self.core.try_send(topic, wire).inspect_err(|e| {
            tracing::warn!("pubsub send dropped: {e}");
        })
    }
}

impl DataReceiver for PubSubAdaptor {
    fn register_impl(&self, consumer: Arc<dyn MessageConsumer>, service_id: &str) -> Result<()> {
        let rule = self.core.registry.routing_rule(service_id)?;
        self.core
            .consumers
            .set_impl(service_id.to_string(), consumer);
        let topic = rule.pubsub.subscribe_key(&self.core.district, None);
        if !topic.is_empty() {
            self.core.queue_subscribe(topic);
        }
        Ok(())
    }

    fn begin_receive(&self) -> Result<()> {
        if !self.core.supervisor.begin() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "pubsub receive loop already started".to_string(),
            ));
        }
        tokio::spawn(self.core.clone().run());
        Ok(())
    }
}

impl Pollable for PubSubAdaptor {
    fn poll(&self) {
        self.core.deferred.drain(&self.core.observers);
    }
}

impl std::fmt::Debug for PubSubAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubAdaptor")
            .field("peer", &self.core.peer)
            .finish()
    }
}
