use std::{collections::HashMap, hash::Hash, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{Mode, PeerId, RoutingRule, error::Result};

/// Receives inbound logical frames for one registered service.
///
/// The adaptor strips its transport envelope and hands the inner frame to
/// the consumer selected by `(service id, mode)`. `reply` is the
/// transport-specific reverse path for this delivery; `None` when the
/// transport has no reverse send for the message (notify-only paths).
pub trait MessageConsumer: Send + Sync {
    fn on_receive_message(&self, mode: Mode, buf: Bytes, reply: Option<Arc<dyn ReplySender>>);
}

/// Reverse path supplied by an adaptor at receive time.
///
/// Broker transports compute the reverse address from the caller identity
/// and the service's routing rule; the gateway unicasts back to the caller.
pub trait ReplySender: Send + Sync {
    fn send_reply(&self, buf: Bytes, dst: PeerId, rule: &RoutingRule);
}

/// Outbound capability of a transport adaptor.
pub trait DataSender: Send + Sync {
    /// Logical identity of this adaptor, stable across reconnects.
    fn peer_id(&self) -> PeerId;

    /// Binds a consumer to inbound Return traffic for a service. Last write
    /// wins on re-registration.
    fn register_delegate(&self, consumer: Arc<dyn MessageConsumer>, service_id: &str)
    -> Result<()>;

    /// Transmits an opaque payload. Never blocks: encoding and enqueue are
    /// local synchronous work, network I/O happens on background tasks.
    /// Delivery guarantee and the while-disconnected policy are documented
    /// per binding.
    fn send(&self, buf: Bytes, mode: Mode, dst: Option<PeerId>, rule: &RoutingRule) -> Result<()>;
}

/// Inbound capability of a transport adaptor.
pub trait DataReceiver: Send + Sync {
    /// Binds a consumer to inbound Invoke/Notify/Sync traffic for a service.
    /// Last write wins on re-registration.
    fn register_impl(&self, consumer: Arc<dyn MessageConsumer>, service_id: &str) -> Result<()>;

    /// Starts inbound processing without blocking the caller. Exactly one
    /// receive loop per adaptor instance; startup connection failures are
    /// logged and surfaced to the adaptor's observers, never dropped.
    fn begin_receive(&self) -> Result<()>;
}

/// The full send/receive capability pair.
pub trait Adaptor: DataSender + DataReceiver {}

impl<T: DataSender + DataReceiver> Adaptor for T {}

/// Optional capability: forward-group multicast.
pub trait MulticastSender: Send + Sync {
    fn multicast_send(
        &self,
        buf: Bytes,
        mode: Mode,
        forward_id: u32,
        rule: &RoutingRule,
    ) -> Result<()>;
}

/// Optional capability: poll-driven delivery.
///
/// Consumer callbacks execute only inside `poll()`, on the owning
/// application thread, so they never run concurrently with each other even
/// though I/O happens on background tasks.
pub trait Pollable: Send + Sync {
    fn poll(&self);
}

/// The impl/delegate consumer registration tables every adaptor carries.
///
/// Return traffic routes to delegates, everything else to impls. Written
/// from the application thread, read from I/O tasks.
pub(crate) struct ConsumerTable<K> {
    impls: RwLock<HashMap<K, Arc<dyn MessageConsumer>>>,
    delegates: RwLock<HashMap<K, Arc<dyn MessageConsumer>>>,
}

impl<K: Eq + Hash> Default for ConsumerTable<K> {
    fn default() -> Self {
        Self {
            impls: RwLock::default(),
            delegates: RwLock::default(),
        }
    }
}

impl<K: Eq + Hash> ConsumerTable<K> {
    pub fn set_impl(&self, key: K, consumer: Arc<dyn MessageConsumer>) {
        self.impls.write().insert(key, consumer);
    }

    pub fn set_delegate(&self, key: K, consumer: Arc<dyn MessageConsumer>) {
        self.delegates.write().insert(key, consumer);
    }

    pub fn route(&self, mode: Mode, key: &K) -> Option<Arc<dyn MessageConsumer>> {
        let table = if mode == Mode::Return {
            &self.delegates
        } else {
            &self.impls
        };
        table.read().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(std::sync::atomic::AtomicUsize);

    impl MessageConsumer for Recorder {
        fn on_receive_message(&self, _: Mode, _: Bytes, _: Option<Arc<dyn ReplySender>>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_route_by_mode() {
        let table = ConsumerTable::<String>::default();
        let implement = Arc::new(Recorder(Default::default()));
        let delegate = Arc::new(Recorder(Default::default()));
        table.set_impl("svc".to_string(), implement.clone());
        table.set_delegate("svc".to_string(), delegate.clone());

        let key = "svc".to_string();
        for (mode, expected) in [
            (Mode::Invoke, 1usize),
            (Mode::Notify, 2),
            (Mode::Sync, 3),
        ] {
            let consumer = table.route(mode, &key).unwrap();
            consumer.on_receive_message(mode, Bytes::new(), None);
            assert_eq!(implement.0.load(std::sync::atomic::Ordering::SeqCst), expected);
        }

        let consumer = table.route(Mode::Return, &key).unwrap();
        consumer.on_receive_message(Mode::Return, Bytes::new(), None);
        assert_eq!(delegate.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        assert!(table.route(Mode::Invoke, &"other".to_string()).is_none());
    }

    #[test]
    fn test_last_registration_wins() {
        let table = ConsumerTable::<u32>::default();
        let first = Arc::new(Recorder(Default::default()));
        let second = Arc::new(Recorder(Default::default()));
        table.set_impl(7, first.clone());
        table.set_impl(7, second.clone());

        let consumer = table.route(Mode::Invoke, &7).unwrap();
        consumer.on_receive_message(Mode::Invoke, Bytes::new(), None);
        assert_eq!(first.0.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(second.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
