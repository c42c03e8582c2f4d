use std::{any::Any, sync::Arc};

use bytes::{Bytes, BytesMut};

use crate::{
    CallFrame, Mode, PeerId, Registry, ReturnFrame, RoutingRule,
    adaptor::{DataReceiver, MessageConsumer, ReplySender},
    error::Result,
    serializer::{MethodCall, MethodSerializer},
};

/// Completion callback handed to the dispatcher: called exactly once with
/// the handler outcome, synchronously or from a deferred task.
pub type ResultSender = Box<dyn FnOnce(Result<rmpv::Value>) + Send + 'static>;

/// Application-supplied method dispatcher: routes a decoded call to the
/// implementation instance and reports the outcome through `result`.
pub trait MethodDispatcher: Send + Sync {
    fn dispatch(&self, instance: Arc<dyn RpcImpl>, call: MethodCall, result: ResultSender);
}

/// Type-erased service implementation.
///
/// `bind_source` derives the instance variant bound to the caller's
/// identity for the duration of one call; implementations that ignore the
/// caller can return themselves. Dispatchers recover the concrete type via
/// `as_any`.
pub trait RpcImpl: Send + Sync {
    fn bind_source(self: Arc<Self>, src_peer: PeerId) -> Arc<dyn RpcImpl>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Callee-side stub: decodes inbound calls, hands them to the registered
/// dispatcher and encodes the reply back through the adaptor-supplied
/// reverse path.
pub struct ImplementStub {
    dispatcher: Arc<dyn MethodDispatcher>,
    serializer: Arc<dyn MethodSerializer>,
    routing_rule: Arc<RoutingRule>,
    instance: Arc<dyn RpcImpl>,
}

impl ImplementStub {
    /// Looks the service up in the registry and registers the stub as the
    /// call-traffic consumer on the given receiver.
    pub fn bind(
        receiver: &dyn DataReceiver,
        registry: &Registry,
        service: &str,
        instance: Arc<dyn RpcImpl>,
    ) -> Result<Arc<Self>> {
        let service_id = registry.service_id(service)?;
        let stub = Arc::new(Self {
            dispatcher: registry.dispatcher(service)?,
            serializer: registry.serializer(service)?,
            routing_rule: registry.routing_rule(&service_id)?,
            instance,
        });
        receiver.register_impl(stub.clone(), &service_id)?;
        Ok(stub)
    }

    fn send_return(
        serializer: &dyn MethodSerializer,
        routing_rule: &RoutingRule,
        reply: Option<&Arc<dyn ReplySender>>,
        dst: PeerId,
        invoke_id: u32,
        method_id: u32,
        outcome: Result<rmpv::Value>,
    ) {
        let frame = match outcome {
            Ok(value) => {
                let mut body = Vec::with_capacity(16);
                match serializer.write_return(method_id, &value, &mut body) {
                    Ok(()) => ReturnFrame {
                        invoke_id,
                        status: ReturnFrame::STATUS_OK,
                        value: body.into(),
                    },
                    Err(e) => {
                        tracing::error!("encoding return value for method {method_id} failed: {e}");
                        ReturnFrame {
                            invoke_id,
                            status: ReturnFrame::STATUS_FAILED,
                            value: Bytes::new(),
                        }
                    }
                }
            }
            Err(e) => {
                // handler failure stays local, the caller only sees the flag
                tracing::error!("handler for method {method_id} failed: {e}");
                ReturnFrame {
                    invoke_id,
                    status: ReturnFrame::STATUS_FAILED,
                    value: Bytes::new(),
                }
            }
        };

        let Some(reply) = reply else {
            tracing::debug!("no reply channel for invoke {invoke_id}, dropping return");
            return;
        };
        let mut out = BytesMut::with_capacity(16 + frame.value.len());
        frame.encode(&mut out);
        reply.send_reply(out.freeze(), dst, routing_rule);
    }
}

impl MessageConsumer for ImplementStub {
    fn on_receive_message(&self, mode: Mode, buf: Bytes, reply: Option<Arc<dyn ReplySender>>) {
        let frame = match CallFrame::parse(buf) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("malformed call frame: {e}");
                return;
            }
        };

        let args = match self.serializer.read_call(frame.method_id, &frame.args) {
            Ok(args) => args,
            Err(e) => {
                tracing::error!("decoding args for method {} failed: {e}", frame.method_id);
                if mode.expects_reply() {
                    Self::send_return(
                        self.serializer.as_ref(),
                        &self.routing_rule,
                        reply.as_ref(),
                        frame.src_peer,
                        frame.invoke_id,
                        frame.method_id,
                        Err(e),
                    );
                }
                return;
            }
        };

        let call = MethodCall {
            src_peer: frame.src_peer,
            invoke_id: frame.invoke_id,
            method_id: frame.method_id,
            args,
        };

        let serializer = self.serializer.clone();
        let routing_rule = self.routing_rule.clone();
        let expects_reply = mode.expects_reply();
        let result: ResultSender = Box::new(move |outcome| {
            if !expects_reply {
                if let Err(e) = outcome {
                    tracing::error!("notify handler for method {} failed: {e}", frame.method_id);
                }
                return;
            }
            Self::send_return(
                serializer.as_ref(),
                &routing_rule,
                reply.as_ref(),
                frame.src_peer,
                frame.invoke_id,
                frame.method_id,
                outcome,
            );
        });

        let instance = self.instance.clone().bind_source(call.src_peer);
        self.dispatcher.dispatch(instance, call, result);
    }
}

impl std::fmt::Debug for ImplementStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImplementStub").finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        error::{Error, ErrorKind},
        serializer::{self, RmpSerializer},
    };

    struct Adder;

    impl RpcImpl for Adder {
        fn bind_source(self: Arc<Self>, _src_peer: PeerId) -> Arc<dyn RpcImpl> {
            self
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct AdderDispatcher;

    impl MethodDispatcher for AdderDispatcher {
        fn dispatch(&self, instance: Arc<dyn RpcImpl>, call: MethodCall, result: ResultSender) {
            let _adder: Arc<Adder> = instance.as_any().downcast().unwrap();
            let outcome = match call.method_id {
                1 => serializer::from_value::<(u32, u32)>(call.args)
                    .map(|(a, b)| rmpv::Value::from(a + b)),
                _ => Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("unknown method {}", call.method_id),
                )),
            };
            result(outcome);
        }
    }

    #[derive(Default)]
    struct ReplyRecorder {
        replies: Mutex<Vec<(Bytes, PeerId)>>,
    }

    impl ReplySender for ReplyRecorder {
        fn send_reply(&self, buf: Bytes, dst: PeerId, _rule: &RoutingRule) {
            self.replies.lock().push((buf, dst));
        }
    }

    struct NopReceiver;

    impl DataReceiver for NopReceiver {
        fn register_impl(
            &self,
            _consumer: Arc<dyn MessageConsumer>,
            _service_id: &str,
        ) -> Result<()> {
            Ok(())
        }

        fn begin_receive(&self) -> Result<()> {
            Ok(())
        }
    }

    fn adder_stub() -> Arc<ImplementStub> {
        let registry = Registry::new("dev");
        registry.set_service_id("Adder", "adder").unwrap();
        registry.set_serializer("Adder", Arc::new(RmpSerializer)).unwrap();
        registry.set_dispatcher("Adder", Arc::new(AdderDispatcher)).unwrap();
        registry.set_routing_rule("adder", RoutingRule::default()).unwrap();
        ImplementStub::bind(&NopReceiver, &registry, "Adder", Arc::new(Adder)).unwrap()
    }

    fn call_frame(invoke_id: u32, method_id: u32, args: &impl serde::Serialize) -> Bytes {
        let mut body = Vec::new();
        RmpSerializer
            .write_call(method_id, &serializer::to_value(args).unwrap(), &mut body)
            .unwrap();
        let frame = CallFrame {
            src_peer: PeerId::random(),
            invoke_id,
            method_id,
            args: body.into(),
        };
        let mut out = BytesMut::new();
        frame.encode(&mut out);
        out.freeze()
    }

    #[test]
    fn test_dispatch_and_reply() {
        let stub = adder_stub();
        let reply = Arc::new(ReplyRecorder::default());

        stub.on_receive_message(Mode::Invoke, call_frame(5, 1, &(2u32, 3u32)), Some(reply.clone()));

        let replies = reply.replies.lock();
        assert_eq!(replies.len(), 1);
        let frame = ReturnFrame::parse(replies[0].0.clone()).unwrap();
        assert_eq!(frame.invoke_id, 5);
        assert!(frame.is_ok());
        let value: u32 =
            serializer::from_value(RmpSerializer.read_return(1, &frame.value).unwrap()).unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn test_handler_failure_reports_status_only() {
        let stub = adder_stub();
        let reply = Arc::new(ReplyRecorder::default());

        stub.on_receive_message(Mode::Sync, call_frame(9, 999, &()), Some(reply.clone()));

        let replies = reply.replies.lock();
        let frame = ReturnFrame::parse(replies[0].0.clone()).unwrap();
        assert_eq!(frame.invoke_id, 9);
        assert!(!frame.is_ok());
        assert!(frame.value.is_empty());
    }

    #[test]
    fn test_notify_never_replies() {
        let stub = adder_stub();
        let reply = Arc::new(ReplyRecorder::default());

        stub.on_receive_message(Mode::Notify, call_frame(0, 1, &(1u32, 1u32)), Some(reply.clone()));
        // even a failing notify handler produces no return frame
        stub.on_receive_message(Mode::Notify, call_frame(0, 999, &()), Some(reply.clone()));

        assert!(reply.replies.lock().is_empty());
    }
}
