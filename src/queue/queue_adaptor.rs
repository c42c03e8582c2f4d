use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::sync::Notify;
use tokio_util::sync::DropGuard;

use super::{Delivery, QueueClient, QueueHandle, QueueSession};
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
pub struct QueueConfig {
    #[serde_inline_default(Duration::from_millis(500))]
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
    #[serde_inline_default(1024)]
    pub outbox_capacity: usize,
    #[serde_inline_default(1024)]
    pub deferred_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(Default::default())).unwrap()
    }
}

/// A queue+binding+consume triple derived from one service registration.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BindSpec {
    queue: String,
    exchange: String,
    binding_key: String,
}

#[derive(Default)]
struct BindState {
    pending: Vec<BindSpec>,
    active: Vec<BindSpec>,
}

struct Outbound {
    exchange: String,
    routing_key: String,
    payload: Bytes,
}

struct QueueCore {
    peer: PeerId,
    district: String,
    registry: Arc<Registry>,
    client: Arc<dyn QueueClient>,
    config: QueueConfig,
    consumers: ConsumerTable<String>,
    bindings: Mutex<BindState>,
    bind_added: Notify,
    outbox: Mutex<VecDeque<Outbound>>,
    out_added: Notify,
    deferred: DeferredQueue,
    observers: ConnectionObservers,
    supervisor: TaskSupervisor,
    attempt: AtomicU64,
}

/// Queue-broker transport adaptor.
///
/// Unlike the gateway and topic bindings this one buffers: sends attempted
/// while no session is live sit in a bounded outbox and flush once the
/// broker is back. Queues and bindings are derived from routing rules at
/// registration time and re-declared on every session, so a reconnect
/// restores the full consume set.
pub struct QueueAdaptor {
    core: Arc<QueueCore>,
}

impl QueueAdaptor {
    #[must_use]
    pub fn new(
        client: Arc<dyn QueueClient>,
        config: QueueConfig,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            core: Arc::new(QueueCore {
                peer: PeerId::random(),
                district: registry.district().to_string(),
                registry,
                client,
                deferred: DeferredQueue::new(config.deferred_capacity),
                config,
                consumers: ConsumerTable::default(),
                bindings: Mutex::default(),
                bind_added: Notify::new(),
                outbox: Mutex::default(),
                out_added: Notify::new(),
                observers: ConnectionObservers::default(),
                supervisor: TaskSupervisor::new(),
                attempt: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn observers(&self) -> &ConnectionObservers {
        &self.core.observers
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

impl QueueCore {
    fn queue_bind(&self, spec: BindSpec) {
        {
            let mut bindings = self.bindings.lock();
            if bindings.active.contains(&spec) || bindings.pending.contains(&spec) {
                return;
            }
            bindings.pending.push(spec);
        }
        self.bind_added.notify_one();
    }

    fn enqueue_out(&self, exchange: String, routing_key: String, payload: Bytes) -> Result<()> {
        {
            let mut outbox = self.outbox.lock();
            if outbox.len() >= self.config.outbox_capacity {
                return Err(Error::new(
                    ErrorKind::SendFailed,
                    format!("outbox full ({} messages)", outbox.len()),
                ));
            }
            outbox.push_back(Outbound {
                exchange,
                routing_key,
                payload,
            });
        }
        self.out_added.notify_one();
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let guard = self.supervisor.start_task();
        loop {
            let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
            let client_id = format!("{}-{attempt}", self.peer);
            match self.client.connect(&client_id).await {
                Ok(session) => {
                    {
                        let mut bindings = self.bindings.lock();
                        let active = std::mem::take(&mut bindings.active);
                        bindings.pending.extend(active);
                    }
                    self.deferred.push(DeferredJob::Connected);
                    tracing::info!("queue session {client_id} established");

                    tokio::select! {
                        () = guard.stopped() => return,
                        r = self.session_loop(session) => {
                            if let Err(e) = r {
                                tracing::error!("queue session lost: {e}");
                            }
                        }
                    }
                    self.deferred.push(DeferredJob::Disconnected);
                }
                Err(e) => {
                    tracing::error!("queue connect failed: {e}");
                    self.deferred.push(DeferredJob::ConnectFailed(e));
                }
            }

            tokio::select! {
                () = guard.stopped() => return,
                () = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }
    }

    async fn session_loop(self: &Arc<Self>, mut session: QueueSession) -> Result<()> {
        loop {
            self.flush_bindings(session.handle.as_ref()).await;
            self.flush_outbox(session.handle.as_ref()).await?;
            tokio::select! {
                () = self.bind_added.notified() => {}
                () = self.out_added.notified() => {}
                delivery = session.deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        return Err(Error::new(
                            ErrorKind::RecvFailed,
                            "queue session closed".to_string(),
                        ));
                    };
                    self.handle_delivery(delivery);
                }
            }
        }
    }

    async fn flush_bindings(&self, handle: &dyn QueueHandle) {
        loop {
            let spec = { self.bindings.lock().pending.pop() };
            let Some(spec) = spec else { return };
            match Self::apply_binding(handle, &spec).await {
                Ok(()) => {
                    tracing::debug!("consuming {} via {spec:?}", spec.queue);
                    self.bindings.lock().active.push(spec);
                }
                Err(e) => {
                    tracing::error!("binding {spec:?} failed: {e}");
                    // keep it queued for the next session
                    self.bindings.lock().pending.push(spec);
                    return;
                }
            }
        }
    }

    async fn apply_binding(handle: &dyn QueueHandle, spec: &BindSpec) -> Result<()> {
        handle.declare_queue(&spec.queue).await?;
        if !spec.exchange.is_empty() && !spec.binding_key.is_empty() {
            handle
                .bind(&spec.queue, &spec.exchange, &spec.binding_key)
                .await?;
        }
        handle.consume(&spec.queue).await
    }

    /// A publish failure tears the session down; the message stays queued
    /// and flushes on the next session.
    async fn flush_outbox(&self, handle: &dyn QueueHandle) -> Result<()> {
        loop {
            let out = { self.outbox.lock().pop_front() };
            let Some(out) = out else { return Ok(()) };
            if let Err(e) = handle
                .publish(&out.exchange, &out.routing_key, out.payload.clone())
                .await
            {
                self.outbox.lock().push_front(out);
                return Err(e);
            }
        }
    }

    fn handle_delivery(self: &Arc<Self>, delivery: Delivery) {
        let (envelope, inner) = match Envelope::unwrap(delivery.payload) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!("malformed envelope on queue {}: {e}", delivery.queue);
                return;
            }
        };
        let Some(consumer) = self.consumers.route(envelope.mode, &envelope.service_id) else {
            tracing::debug!(
                "no consumer for {} ({:?}) on queue {}",
                envelope.service_id,
                envelope.mode,
                delivery.queue
            );
            return;
        };
        let reply: Option<Arc<dyn ReplySender>> = if envelope.mode.expects_reply() {
            Some(Arc::new(QueueReply { core: self.clone() }))
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

    fn reply_queue_name(&self, rule: &RoutingRule) -> String {
        let base = rule.queue.return_queue(&self.district);
        if base.is_empty() {
            format!("reply.{}", self.peer)
        } else {
            format!("{base}.{}", self.peer)
        }
    }
}

struct QueueReply {
    core: Arc<QueueCore>,
}

impl ReplySender for QueueReply {
    fn send_reply(&self, buf: Bytes, dst: PeerId, rule: &RoutingRule) {
        let routing_key = rule.queue.return_routing_key(&self.core.district, Some(dst));
        if routing_key.is_empty() {
            tracing::warn!("no return routing key for {}, dropping", rule.service_id);
            return;
        }
        let envelope = Envelope {
            mode: Mode::Return,
            service_id: rule.service_id.clone(),
        };
        let outcome = envelope.wrap(&buf).and_then(|wire| {
            self.core
                .enqueue_out(rule.queue.return_exchange(), routing_key, wire)
        });
        if let Err(e) = outcome {
            tracing::warn!("queue return to {dst} dropped: {e}");
        }
    }
}

impl DataSender for QueueAdaptor {
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
        // returns arrive on a queue private to this peer
        let binding_key = rule
            .queue
            .return_binding_key(&self.core.district, Some(self.core.peer));
        self.core.queue_bind(BindSpec {
            queue: self.core.reply_queue_name(&rule),
            exchange: rule.queue.return_exchange(),
            binding_key,
        });
        Ok(())
    }

    fn send(&self, buf: Bytes, mode: Mode, dst: Option<PeerId>, rule: &RoutingRule) -> Result<()> {
        let routing_key = rule.queue.delegate_routing_key(&self.core.district, dst);
        if routing_key.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("no delegate routing key for service {}", rule.service_id),
            ));
        }
        let envelope = Envelope {
            mode,
            service_id: rule.service_id.clone(),
        };
        let wire = envelope.wrap(&buf)?;
        self.core
            .enqueue_out(rule.queue.delegate_exchange(), routing_key, wire)
    }
}

impl DataReceiver for QueueAdaptor {
    fn register_impl(&self, consumer: Arc<dyn MessageConsumer>, service_id: &str) -> Result<()> {
        let rule = self.core.registry.routing_rule(service_id)?;
        self.core
            .consumers
            .set_impl(service_id.to_string(), consumer);
        let queue = rule.queue.impl_queue(&self.core.district);
        if queue.is_empty() {
            tracing::debug!("service {service_id} declares no impl queue");
            return Ok(());
        }
        self.core.queue_bind(BindSpec {
            queue,
            exchange: rule.queue.impl_exchange(),
            binding_key: rule.queue.impl_binding_key(&self.core.district, None),
        });
        Ok(())
    }

    fn begin_receive(&self) -> Result<()> {
        if !self.core.supervisor.begin() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "queue receive loop already started".to_string(),
            ));
        }
        tokio::spawn(self.core.clone().run());
        Ok(())
    }
}

impl Pollable for QueueAdaptor {
    fn poll(&self) {
        self.core.deferred.drain(&self.core.observers);
    }
}

impl std::fmt::Debug for QueueAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueAdaptor")
            .field("peer", &self.core.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.reconnect_backoff, Duration::from_millis(500));
        assert_eq!(config.outbox_capacity, 1024);

        let parsed: QueueConfig =
            serde_json::from_str(r#"{ "outbox_capacity": 8 }"#).unwrap();
        assert_eq!(parsed.outbox_capacity, 8);
        assert_eq!(parsed.deferred_capacity, 1024);
    }
}
