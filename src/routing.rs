use std::sync::Arc;

use crate::PeerId;

/// `(district, peer) -> address` function.
pub type PeerAddrFn = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;
/// `(district) -> address` function.
pub type DistrictAddrFn = Arc<dyn Fn(&str) -> String + Send + Sync>;
/// `() -> address` function.
pub type FixedAddrFn = Arc<dyn Fn() -> String + Send + Sync>;
/// `(district) -> numeric service id` function.
pub type ServiceIdFn = Arc<dyn Fn(&str) -> u32 + Send + Sync>;

fn peer_arg(peer: Option<PeerId>) -> String {
    peer.map(|p| p.to_string()).unwrap_or_default()
}

/// Queue-broker addressing: exchanges, routing keys and queue names for the
/// delegate (outbound call), impl (inbound call) and return directions.
#[derive(Clone, Default)]
pub struct QueueRule {
    delegate_routing_key: Option<PeerAddrFn>,
    delegate_exchange: Option<FixedAddrFn>,
    impl_binding_key: Option<PeerAddrFn>,
    impl_exchange: Option<FixedAddrFn>,
    impl_queue: Option<DistrictAddrFn>,
    return_binding_key: Option<PeerAddrFn>,
    return_routing_key: Option<PeerAddrFn>,
    return_exchange: Option<FixedAddrFn>,
    return_queue: Option<DistrictAddrFn>,
}

macro_rules! peer_getter {
    ($get:ident, $set:ident, $field:ident) => {
        #[must_use]
        pub fn $get(&self, district: &str, peer: Option<PeerId>) -> String {
            match &self.$field {
                Some(f) => f(district, &peer_arg(peer)),
                None => String::new(),
            }
        }

        #[must_use]
        pub fn $set(mut self, f: PeerAddrFn) -> Self {
            self.$field = Some(f);
            self
        }
    };
}

macro_rules! fixed_getter {
    ($get:ident, $set:ident, $field:ident) => {
        #[must_use]
        pub fn $get(&self) -> String {
            match &self.$field {
                Some(f) => f(),
                None => String::new(),
            }
        }

        #[must_use]
        pub fn $set(mut self, f: FixedAddrFn) -> Self {
            self.$field = Some(f);
            self
        }
    };
}

macro_rules! district_getter {
    ($get:ident, $set:ident, $field:ident) => {
        #[must_use]
        pub fn $get(&self, district: &str) -> String {
            match &self.$field {
                Some(f) => f(district),
                None => String::new(),
            }
        }

        #[must_use]
        pub fn $set(mut self, f: DistrictAddrFn) -> Self {
            self.$field = Some(f);
            self
        }
    };
}

impl QueueRule {
    peer_getter!(delegate_routing_key, with_delegate_routing_key, delegate_routing_key);
    fixed_getter!(delegate_exchange, with_delegate_exchange, delegate_exchange);
    peer_getter!(impl_binding_key, with_impl_binding_key, impl_binding_key);
    fixed_getter!(impl_exchange, with_impl_exchange, impl_exchange);
    district_getter!(impl_queue, with_impl_queue, impl_queue);
    peer_getter!(return_binding_key, with_return_binding_key, return_binding_key);
    peer_getter!(return_routing_key, with_return_routing_key, return_routing_key);
    fixed_getter!(return_exchange, with_return_exchange, return_exchange);
    district_getter!(return_queue, with_return_queue, return_queue);
}

/// Pub/sub addressing: one topic to publish to and one to subscribe on.
#[derive(Clone, Default)]
pub struct PubSubRule {
    publish_key: Option<PeerAddrFn>,
    subscribe_key: Option<PeerAddrFn>,
}

impl PubSubRule {
    peer_getter!(publish_key, with_publish_key, publish_key);
    peer_getter!(subscribe_key, with_subscribe_key, subscribe_key);
}

/// Gateway addressing: a numeric service id per district.
#[derive(Clone, Default)]
pub struct GateRule {
    service_id: Option<ServiceIdFn>,
}

impl GateRule {
    #[must_use]
    pub fn service_id(&self, district: &str) -> u32 {
        match &self.service_id {
            Some(f) => f(district),
            None => 0,
        }
    }

    #[must_use]
    pub fn with_service_id(mut self, f: ServiceIdFn) -> Self {
        self.service_id = Some(f);
        self
    }
}

/// Coordination-service addressing: the node path data flows through.
#[derive(Clone, Default)]
pub struct CoordRule {
    service_path: Option<DistrictAddrFn>,
}

impl CoordRule {
    district_getter!(service_path, with_service_path, service_path);
}

/// Per-service bundle of address functions, one sub-rule per transport kind.
///
/// An unset function yields an empty/zero address instead of failing, so a
/// service active on a subset of transports needs no special-casing in
/// adaptor code.
///
/// `service_id` is stamped by the registry at registration time; broker
/// envelopes carry it so the receiving side can pick the right consumer.
#[derive(Clone, Default)]
pub struct RoutingRule {
    pub service_id: String,
    pub queue: QueueRule,
    pub pubsub: PubSubRule,
    pub gate: GateRule,
    pub coord: CoordRule,
}

impl std::fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRule")
            .field("service_id", &self.service_id)
            .finish()
    }
}
