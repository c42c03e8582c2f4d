use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use bytes::{Bytes, BytesMut};
use foldhash::fast::RandomState;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::oneshot;

use crate::{
    CallFrame, InvokeOperation, Mode, PeerId, Registry, ReturnFrame, RoutingRule,
    adaptor::{DataSender, MessageConsumer, ReplySender},
    error::{Error, ErrorKind, Result},
    serializer::{self, MethodSerializer},
};

struct Pending {
    method_id: u32,
    tx: oneshot::Sender<Result<rmpv::Value>>,
}

/// Mutable correlation state: outstanding operations keyed by invoke id.
///
/// Removal and resolution are one atomic map-remove, so a reply can never
/// resolve an operation twice and duplicate deliveries fall through.
#[derive(Default)]
pub(crate) struct PendingTable {
    next: AtomicU32,
    map: dashmap::DashMap<u32, Pending, RandomState>,
}

impl PendingTable {
    /// Allocates the next invoke id and inserts its pending entry.
    ///
    /// Ids wrap at `u32::MAX` and are reused only after the prior holder
    /// resolved: an id still pending is skipped.
    pub fn alloc(&self, method_id: u32) -> (u32, oneshot::Receiver<Result<rmpv::Value>>) {
        loop {
            let invoke_id = self.next.fetch_add(1, Ordering::SeqCst);
            match self.map.entry(invoke_id) {
                dashmap::Entry::Occupied(_) => continue,
                dashmap::Entry::Vacant(entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.insert(Pending { method_id, tx });
                    return (invoke_id, rx);
                }
            }
        }
    }

    /// Atomically pops and resolves one pending operation. Returns false
    /// when the id is unknown or already resolved.
    pub fn resolve(&self, invoke_id: u32, result: Result<rmpv::Value>) -> bool {
        if let Some((_, pending)) = self.map.remove(&invoke_id) {
            let _ = pending.tx.send(result);
            true
        } else {
            false
        }
    }

    pub fn abandon(&self, invoke_id: u32) {
        self.map.remove(&invoke_id);
    }

    #[cfg(test)]
    pub fn contains(&self, invoke_id: u32) -> bool {
        self.map.contains_key(&invoke_id)
    }
}

/// Caller-side stub: issues and tracks outstanding calls for one service
/// and resolves them when the correlated Return frame arrives.
pub struct DelegateStub {
    sender: Arc<dyn DataSender>,
    serializer: Arc<dyn MethodSerializer>,
    routing_rule: Arc<RoutingRule>,
    pending: Arc<PendingTable>,
}

impl DelegateStub {
    /// Looks the service up in the registry and registers the stub as the
    /// Return-traffic consumer on the given sender.
    pub fn bind(
        sender: Arc<dyn DataSender>,
        registry: &Registry,
        service: &str,
    ) -> Result<Arc<Self>> {
        let service_id = registry.service_id(service)?;
        let serializer = registry.serializer(service)?;
        let routing_rule = registry.routing_rule(&service_id)?;

        let stub = Arc::new(Self {
            sender,
            serializer,
            routing_rule,
            pending: Arc::default(),
        });
        stub.sender.register_delegate(stub.clone(), &service_id)?;
        Ok(stub)
    }

    #[must_use]
    pub fn routing_rule(&self) -> &RoutingRule {
        &self.routing_rule
    }

    /// Fire-and-forget call: invoke id 0, no pending entry, no completion
    /// signal.
    pub fn notify<A: Serialize>(
        &self,
        method_id: u32,
        dst: Option<PeerId>,
        args: &A,
    ) -> Result<()> {
        let frame = self.encode_call(0, method_id, args)?;
        self.sender.send(frame, Mode::Notify, dst, &self.routing_rule)
    }

    /// Request-with-reply call. The pending entry is inserted before the
    /// frame is sent so a fast reply can never race past its own entry.
    pub fn invoke<A: Serialize, T: DeserializeOwned + Send + 'static>(
        &self,
        method_id: u32,
        dst: Option<PeerId>,
        args: &A,
    ) -> Result<InvokeOperation<T>> {
        self.call(Mode::Invoke, method_id, dst, args)
    }

    /// Server-initiated request-with-reply.
    pub fn sync_invoke<A: Serialize, T: DeserializeOwned + Send + 'static>(
        &self,
        method_id: u32,
        dst: Option<PeerId>,
        args: &A,
    ) -> Result<InvokeOperation<T>> {
        self.call(Mode::Sync, method_id, dst, args)
    }

    fn call<A: Serialize, T: DeserializeOwned + Send + 'static>(
        &self,
        mode: Mode,
        method_id: u32,
        dst: Option<PeerId>,
        args: &A,
    ) -> Result<InvokeOperation<T>> {
        let body = self.encode_args(method_id, args)?;
        let (invoke_id, rx) = self.pending.alloc(method_id);

        let frame = self.encode_frame(invoke_id, method_id, body);
        if let Err(e) = self.sender.send(frame, mode, dst, &self.routing_rule) {
            // no reply will ever come, resolve the handle right here
            self.pending.resolve(invoke_id, Err(e));
        }

        Ok(InvokeOperation::new(
            invoke_id,
            method_id,
            rx,
            self.pending.clone(),
        ))
    }

    fn encode_args<A: Serialize>(&self, method_id: u32, args: &A) -> Result<Bytes> {
        let value = serializer::to_value(args)?;
        let mut body = Vec::with_capacity(32);
        self.serializer.write_call(method_id, &value, &mut body)?;
        Ok(body.into())
    }

    fn encode_call<A: Serialize>(&self, invoke_id: u32, method_id: u32, args: &A) -> Result<Bytes> {
        let body = self.encode_args(method_id, args)?;
        Ok(self.encode_frame(invoke_id, method_id, body))
    }

    fn encode_frame(&self, invoke_id: u32, method_id: u32, args: Bytes) -> Bytes {
        let frame = CallFrame {
            src_peer: self.sender.peer_id(),
            invoke_id,
            method_id,
            args,
        };
        let mut out = BytesMut::with_capacity(64);
        frame.encode(&mut out);
        out.freeze()
    }
}

impl MessageConsumer for DelegateStub {
    /// Consumes one Return frame. Unknown or already-resolved invoke ids
    /// (duplicate deliveries from at-least-once substrates) are discarded
    /// without side effect; decode failures resolve the operation as failed
    /// and never escape into the receive loop.
    fn on_receive_message(&self, mode: Mode, buf: Bytes, _reply: Option<Arc<dyn ReplySender>>) {
        if mode != Mode::Return {
            tracing::warn!("delegate stub received non-return mode {mode:?}, dropping");
            return;
        }

        let frame = match ReturnFrame::parse(buf) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("malformed return frame: {e}");
                return;
            }
        };

        let Some((_, pending)) = self.pending.map.remove(&frame.invoke_id) else {
            tracing::debug!("no pending operation for invoke id {}", frame.invoke_id);
            return;
        };

        let result = if frame.is_ok() {
            self.serializer.read_return(pending.method_id, &frame.value)
        } else {
            Err(Error::new(
                ErrorKind::InvokeFailed,
                format!("callee reported failure, status {}", frame.status),
            ))
        };
        let _ = pending.tx.send(result);
    }
}

impl std::fmt::Debug for DelegateStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateStub").finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::serializer::RmpSerializer;

    struct CapturedSend {
        buf: Bytes,
        mode: Mode,
    }

    #[derive(Default)]
    struct LoopbackSender {
        peer: PeerId,
        sent: Mutex<Vec<CapturedSend>>,
        fail_sends: std::sync::atomic::AtomicBool,
    }

    impl DataSender for LoopbackSender {
        fn peer_id(&self) -> PeerId {
            self.peer
        }

        fn register_delegate(
            &self,
            _consumer: Arc<dyn MessageConsumer>,
            _service_id: &str,
        ) -> Result<()> {
            Ok(())
        }

        fn send(
            &self,
            buf: Bytes,
            mode: Mode,
            _dst: Option<PeerId>,
            _rule: &RoutingRule,
        ) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::kind(ErrorKind::NotConnected));
            }
            self.sent.lock().push(CapturedSend { buf, mode });
            Ok(())
        }
    }

    fn stub_with_sender() -> (Arc<DelegateStub>, Arc<LoopbackSender>) {
        let sender = Arc::new(LoopbackSender::default());
        let registry = Registry::new("dev");
        registry.set_service_id("Echo", "echo").unwrap();
        registry.set_serializer("Echo", Arc::new(RmpSerializer)).unwrap();
        registry.set_routing_rule("echo", RoutingRule::default()).unwrap();
        let stub = DelegateStub::bind(sender.clone(), &registry, "Echo").unwrap();
        (stub, sender)
    }

    fn ok_return(invoke_id: u32, value: &impl Serialize) -> Bytes {
        let mut body = Vec::new();
        RmpSerializer
            .write_return(0, &serializer::to_value(value).unwrap(), &mut body)
            .unwrap();
        let mut out = BytesMut::new();
        ReturnFrame {
            invoke_id,
            status: ReturnFrame::STATUS_OK,
            value: body.into(),
        }
        .encode(&mut out);
        out.freeze()
    }

    #[tokio::test]
    async fn test_invoke_resolves_matching_operation() {
        let (stub, sender) = stub_with_sender();

        let op: InvokeOperation<u32> = stub.invoke(7, None, &(42u32,)).unwrap();
        assert_eq!(op.invoke_id(), 0); // first allocation
        assert_eq!(sender.sent.lock().len(), 1);
        assert_eq!(sender.sent.lock()[0].mode, Mode::Invoke);

        stub.on_receive_message(Mode::Return, ok_return(0, &99u32), None);
        assert_eq!(op.wait().await.unwrap(), 99);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_returns_are_discarded() {
        let (stub, _sender) = stub_with_sender();

        // unknown id: no state change, no error
        stub.on_receive_message(Mode::Return, ok_return(123, &1u32), None);

        let op: InvokeOperation<u32> = stub.invoke(7, None, &()).unwrap();
        let id = op.invoke_id();
        stub.on_receive_message(Mode::Return, ok_return(id, &1u32), None);
        // duplicate delivery of the same return
        stub.on_receive_message(Mode::Return, ok_return(id, &2u32), None);
        assert_eq!(op.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failure_status_and_bad_value() {
        let (stub, _sender) = stub_with_sender();

        let op: InvokeOperation<u32> = stub.invoke(7, None, &()).unwrap();
        let mut out = BytesMut::new();
        ReturnFrame {
            invoke_id: op.invoke_id(),
            status: ReturnFrame::STATUS_FAILED,
            value: Bytes::new(),
        }
        .encode(&mut out);
        stub.on_receive_message(Mode::Return, out.freeze(), None);
        assert_eq!(op.wait().await.unwrap_err().kind, ErrorKind::InvokeFailed);

        // a reply that fails to decode resolves the operation as failed
        let op: InvokeOperation<u32> = stub.invoke(7, None, &()).unwrap();
        let mut out = BytesMut::new();
        ReturnFrame {
            invoke_id: op.invoke_id(),
            status: ReturnFrame::STATUS_OK,
            value: Bytes::from_static(&[0xc1]),
        }
        .encode(&mut out);
        stub.on_receive_message(Mode::Return, out.freeze(), None);
        assert_eq!(
            op.wait().await.unwrap_err().kind,
            ErrorKind::DeserializeFailed
        );
    }

    #[tokio::test]
    async fn test_notify_creates_no_pending_entry() {
        let (stub, sender) = stub_with_sender();
        stub.notify(3, None, &"ping").unwrap();

        let sent = sender.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mode, Mode::Notify);
        let frame = CallFrame::parse(sent[0].buf.clone()).unwrap();
        assert_eq!(frame.invoke_id, 0);
        assert!(!stub.pending.contains(0));
    }

    #[tokio::test]
    async fn test_failed_send_resolves_operation() {
        let (stub, sender) = stub_with_sender();
        sender.fail_sends.store(true, Ordering::SeqCst);

        let op: InvokeOperation<u32> = stub.invoke(7, None, &()).unwrap();
        assert_eq!(op.wait().await.unwrap_err().kind, ErrorKind::NotConnected);
    }

    #[test]
    fn test_alloc_skips_pending_ids() {
        let table = PendingTable::default();
        table.next.store(u32::MAX, Ordering::SeqCst);

        let (a, _rx_a) = table.alloc(1);
        assert_eq!(a, u32::MAX);
        // wraps to 0
        let (b, _rx_b) = table.alloc(1);
        assert_eq!(b, 0);

        // id 0 still pending: the counter walks past it next time around
        table.next.store(0, Ordering::SeqCst);
        let (c, _rx_c) = table.alloc(1);
        assert_eq!(c, 1);
    }

    #[tokio::test]
    async fn test_concurrent_invokes_have_unique_ids() {
        let (stub, _sender) = stub_with_sender();

        let mut ops = Vec::new();
        for i in 0..64u32 {
            let op: InvokeOperation<u32> = stub.invoke(1, None, &(i,)).unwrap();
            ops.push(op);
        }
        let mut ids: Vec<u32> = ops.iter().map(InvokeOperation::invoke_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 64);

        // each resolves exactly once with its own reply
        for op in &ops {
            stub.on_receive_message(Mode::Return, ok_return(op.invoke_id(), &op.invoke_id()), None);
        }
        for op in ops {
            let id = op.invoke_id();
            assert_eq!(op.wait().await.unwrap(), id);
        }
    }
}
