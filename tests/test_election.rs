#![forbid(unsafe_code)]

use std::{any::Any, sync::Arc, time::Duration};

use parking_lot::Mutex;
use polyrpc::{
    CoordAdaptor, CoordConfig, CoordRule, DataReceiver, DataSender, DelegateStub, Error,
    ErrorKind, ImplementStub, MemoryCoord, MethodCall, MethodDispatcher, PeerId, Pollable,
    Registry, ResultSender, RmpSerializer, RoutingRule, RpcImpl,
};

fn setup_registry() -> Arc<Registry> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let registry = Registry::new("dev");
    registry.set_service_id("Announcer", "announcer").unwrap();
    registry
        .set_serializer("Announcer", Arc::new(RmpSerializer))
        .unwrap();
    registry
        .set_dispatcher("Announcer", Arc::new(AnnouncerDispatcher))
        .unwrap();
    let rule = RoutingRule {
        coord: CoordRule::default()
            .with_service_path(Arc::new(|district| format!("/rpc/{district}/announcer"))),
        ..Default::default()
    };
    registry.set_routing_rule("announcer", rule).unwrap();
    registry
}

async fn started_adaptor(coord: &MemoryCoord, registry: &Arc<Registry>) -> Arc<CoordAdaptor> {
    let adaptor = Arc::new(CoordAdaptor::new(
        Arc::new(coord.clone()),
        CoordConfig::default(),
        registry.clone(),
    ));
    adaptor.begin_receive().unwrap();
    {
        let adaptor = adaptor.clone();
        tokio::spawn(async move {
            loop {
                adaptor.poll();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
    }
    // the session is up once identity() stops failing with NotConnected
    for _ in 0..200 {
        match adaptor.identity("warmup").await {
            Ok(()) => return adaptor,
            Err(e) if e.kind == ErrorKind::NotConnected => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("identity failed: {e}"),
        }
    }
    panic!("coordination session never came up");
}

async fn wait_leader(adaptor: &CoordAdaptor, round: &str, expected: bool) {
    for _ in 0..200 {
        if adaptor.is_leader(round).unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("leadership never became {expected}");
}

#[tokio::test]
async fn test_leadership_follows_sequence_order() {
    let registry = setup_registry();
    let coord = MemoryCoord::new();
    let first = started_adaptor(&coord, &registry).await;
    let second = started_adaptor(&coord, &registry).await;
    let third = started_adaptor(&coord, &registry).await;

    first.identity("match").await.unwrap();
    second.identity("match").await.unwrap();
    third.identity("match").await.unwrap();

    wait_leader(&first, "match", true).await;
    assert!(!second.is_leader("match").unwrap());
    assert!(!third.is_leader("match").unwrap());

    // joining twice is a no-op, not a second member node
    first.identity("match").await.unwrap();
    assert!(first.is_leader("match").unwrap());
}

#[tokio::test]
async fn test_failover_to_next_smallest_survivor() {
    let registry = setup_registry();
    let coord = MemoryCoord::new();
    let first = started_adaptor(&coord, &registry).await;
    let second = started_adaptor(&coord, &registry).await;
    let third = started_adaptor(&coord, &registry).await;

    first.identity("match").await.unwrap();
    second.identity("match").await.unwrap();
    third.identity("match").await.unwrap();
    wait_leader(&first, "match", true).await;

    // kill the leader's session: its ephemeral node vanishes and the
    // next-smallest sequence takes over without any message exchange
    coord.kill_session(&first.peer_id().to_string());
    wait_leader(&second, "match", true).await;
    assert!(!third.is_leader("match").unwrap());

    // and again
    coord.kill_session(&second.peer_id().to_string());
    wait_leader(&third, "match", true).await;
}

#[tokio::test]
async fn test_unknown_round_is_loud() {
    let registry = setup_registry();
    let coord = MemoryCoord::new();
    let adaptor = started_adaptor(&coord, &registry).await;

    let err = adaptor.is_leader("nowhere").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoSuchRound);
}

#[derive(Default)]
struct Announcer {
    seen: Mutex<Vec<String>>,
}

impl RpcImpl for Announcer {
    fn bind_source(self: Arc<Self>, _src_peer: PeerId) -> Arc<dyn RpcImpl> {
        self
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct AnnouncerDispatcher;

impl MethodDispatcher for AnnouncerDispatcher {
    fn dispatch(&self, instance: Arc<dyn RpcImpl>, call: MethodCall, result: ResultSender) {
        let announcer: Arc<Announcer> = instance.as_any().downcast().unwrap();
        let outcome = match call.method_id {
            1 => polyrpc::from_value::<(String,)>(call.args).map(|(text,)| {
                announcer.seen.lock().push(text);
                rmpv::Value::Nil
            }),
            _ => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("unknown method {}", call.method_id),
            )),
        };
        result(outcome);
    }
}

#[tokio::test]
async fn test_data_node_messaging() {
    let registry = setup_registry();
    let coord = MemoryCoord::new();
    let receiver = started_adaptor(&coord, &registry).await;
    let sender = started_adaptor(&coord, &registry).await;

    let announcer = Arc::new(Announcer::default());
    let _impl_stub =
        ImplementStub::bind(receiver.as_ref(), &registry, "Announcer", announcer.clone()).unwrap();
    let delegate = DelegateStub::bind(sender.clone(), &registry, "Announcer").unwrap();

    // the watch task needs a moment to provision and subscribe; notifies
    // are fire-and-forget, so just keep announcing until one lands
    for _ in 0..200 {
        delegate.notify(1, None, &("round start".to_string(),)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        if !announcer.seen.lock().is_empty() {
            break;
        }
    }
    assert_eq!(announcer.seen.lock()[0], "round start");
}
