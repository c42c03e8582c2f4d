#![forbid(unsafe_code)]

use std::{any::Any, sync::Arc, time::Duration};

use parking_lot::Mutex;
use polyrpc::{
    DataReceiver, DelegateStub, Error, ErrorKind, ImplementStub, MemoryQueue, MethodCall,
    MethodDispatcher, PeerId, Pollable, QueueAdaptor, QueueConfig, QueueRule, Registry,
    ResultSender, RmpSerializer, RoutingRule, RpcImpl,
};

#[derive(Default)]
struct Greeter {
    notified: Mutex<Vec<String>>,
}

impl RpcImpl for Greeter {
    fn bind_source(self: Arc<Self>, _src_peer: PeerId) -> Arc<dyn RpcImpl> {
        self
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct GreeterDispatcher;

impl MethodDispatcher for GreeterDispatcher {
    fn dispatch(&self, instance: Arc<dyn RpcImpl>, call: MethodCall, result: ResultSender) {
        let greeter: Arc<Greeter> = instance.as_any().downcast().unwrap();
        let outcome = match call.method_id {
            1 => polyrpc::from_value::<(String,)>(call.args)
                .and_then(|(name,)| polyrpc::to_value(&format!("hello {name}!"))),
            2 => polyrpc::from_value::<(String,)>(call.args).map(|(name,)| {
                greeter.notified.lock().push(name);
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

fn setup_registry() -> Arc<Registry> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let registry = Registry::new("dev");
    registry.set_service_id("Greeter", "greeter").unwrap();
    registry
        .set_serializer("Greeter", Arc::new(RmpSerializer))
        .unwrap();
    registry
        .set_dispatcher("Greeter", Arc::new(GreeterDispatcher))
        .unwrap();
    let rule = RoutingRule {
        queue: QueueRule::default()
            .with_delegate_routing_key(Arc::new(|district, _| format!("{district}.greeter.calls")))
            .with_impl_queue(Arc::new(|district| format!("{district}.greeter.calls")))
            .with_return_routing_key(Arc::new(|_, peer| format!("reply.{peer}"))),
        ..Default::default()
    };
    registry.set_routing_rule("greeter", rule).unwrap();
    registry
}

fn spawn_poller(adaptors: Vec<Arc<QueueAdaptor>>) {
    tokio::spawn(async move {
        loop {
            for adaptor in &adaptors {
                adaptor.poll();
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
}

fn adaptor_pair(
    broker: &MemoryQueue,
    registry: &Arc<Registry>,
) -> (Arc<QueueAdaptor>, Arc<QueueAdaptor>) {
    let mut config = QueueConfig::default();
    config.reconnect_backoff = Duration::from_millis(20);
    let server = Arc::new(QueueAdaptor::new(
        Arc::new(broker.clone()),
        config.clone(),
        registry.clone(),
    ));
    let client = Arc::new(QueueAdaptor::new(
        Arc::new(broker.clone()),
        config,
        registry.clone(),
    ));
    (server, client)
}

#[tokio::test]
async fn test_invoke_roundtrip() {
    let registry = setup_registry();
    let broker = MemoryQueue::new();
    let (server, client) = adaptor_pair(&broker, &registry);

    let _impl_stub =
        ImplementStub::bind(server.as_ref(), &registry, "Greeter", Arc::new(Greeter::default()))
            .unwrap();
    let delegate = DelegateStub::bind(client.clone(), &registry, "Greeter").unwrap();

    server.begin_receive().unwrap();
    client.begin_receive().unwrap();
    spawn_poller(vec![server.clone(), client.clone()]);

    let op = delegate
        .invoke::<_, String>(1, None, &("world".to_string(),))
        .unwrap();
    let rsp = op.wait_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(rsp, "hello world!");

    // a second call reuses the established session and reply queue
    let op = delegate
        .invoke::<_, String>(1, None, &("again".to_string(),))
        .unwrap();
    assert_eq!(op.wait_timeout(Duration::from_secs(2)).await.unwrap(), "hello again!");
}

#[tokio::test]
async fn test_invoke_before_session_is_buffered() {
    let registry = setup_registry();
    let broker = MemoryQueue::new();
    let (server, client) = adaptor_pair(&broker, &registry);

    let _impl_stub =
        ImplementStub::bind(server.as_ref(), &registry, "Greeter", Arc::new(Greeter::default()))
            .unwrap();
    let delegate = DelegateStub::bind(client.clone(), &registry, "Greeter").unwrap();

    // enqueue while no broker session exists yet
    let op = delegate
        .invoke::<_, String>(1, None, &("early".to_string(),))
        .unwrap();

    server.begin_receive().unwrap();
    client.begin_receive().unwrap();
    spawn_poller(vec![server.clone(), client.clone()]);

    assert_eq!(op.wait_timeout(Duration::from_secs(2)).await.unwrap(), "hello early!");
}

#[tokio::test]
async fn test_handler_failure_surfaces_as_invoke_error() {
    let registry = setup_registry();
    let broker = MemoryQueue::new();
    let (server, client) = adaptor_pair(&broker, &registry);

    let _impl_stub =
        ImplementStub::bind(server.as_ref(), &registry, "Greeter", Arc::new(Greeter::default()))
            .unwrap();
    let delegate = DelegateStub::bind(client.clone(), &registry, "Greeter").unwrap();
    server.begin_receive().unwrap();
    client.begin_receive().unwrap();
    spawn_poller(vec![server.clone(), client.clone()]);

    let op = delegate
        .invoke::<_, String>(99, None, &("x".to_string(),))
        .unwrap();
    let err = op.wait_timeout(Duration::from_secs(2)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvokeFailed);
}

#[tokio::test]
async fn test_notify_reaches_handler_without_reply() {
    let registry = setup_registry();
    let broker = MemoryQueue::new();
    let (server, client) = adaptor_pair(&broker, &registry);

    let greeter = Arc::new(Greeter::default());
    let _impl_stub =
        ImplementStub::bind(server.as_ref(), &registry, "Greeter", greeter.clone()).unwrap();
    let delegate = DelegateStub::bind(client.clone(), &registry, "Greeter").unwrap();
    server.begin_receive().unwrap();
    client.begin_receive().unwrap();
    spawn_poller(vec![server.clone(), client.clone()]);

    delegate.notify(2, None, &("ping".to_string(),)).unwrap();

    for _ in 0..200 {
        if !greeter.notified.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(greeter.notified.lock().as_slice(), ["ping".to_string()]);
}
