#![forbid(unsafe_code)]

//! Transport-agnostic RPC/messaging layer.
//!
//! Services talk through one contract (register consumers, send frames,
//! await correlated replies) over interchangeable substrates: a framed TCP
//! gateway, a topic broker, a queue broker, and a hierarchical coordination
//! service that also carries leader election.

mod error;
pub use error::{Error, ErrorKind, Result};

mod peer;
pub use peer::PeerId;

mod frame;
pub use frame::{CallFrame, Envelope, Mode, ReturnFrame};

mod serializer;
pub use serializer::{MethodCall, MethodSerializer, RmpSerializer, from_value, to_value};

mod routing;
pub use routing::{
    CoordRule, DistrictAddrFn, FixedAddrFn, GateRule, PeerAddrFn, PubSubRule, QueueRule,
    RoutingRule, ServiceIdFn,
};

mod registry;
pub use registry::Registry;

pub mod adaptor;
pub use adaptor::{
    Adaptor, DataReceiver, DataSender, MessageConsumer, MulticastSender, Pollable, ReplySender,
};

mod deferred;
pub use deferred::ConnectionObservers;

mod task_supervisor;
pub use task_supervisor::TaskSupervisor;

mod operation;
pub use operation::InvokeOperation;

mod delegate;
pub use delegate::DelegateStub;

mod implement;
pub use implement::{ImplementStub, MethodDispatcher, ResultSender, RpcImpl};

pub mod gate;
pub use gate::{ConnState, GateAdaptor, GateConfig};

pub mod pubsub;
pub use pubsub::{MemoryBroker, PubSubAdaptor, PubSubConfig};

pub mod queue;
pub use queue::{MemoryQueue, QueueAdaptor, QueueConfig};

pub mod coord;
pub use coord::{CoordAdaptor, CoordConfig, ElectionState, MemoryCoord};
