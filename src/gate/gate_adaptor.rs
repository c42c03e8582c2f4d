use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::sync::DropGuard;

use super::{GateMessage, codec};
use crate::{
    Mode, PeerId, Registry, RoutingRule, TaskSupervisor,
    adaptor::{
        ConsumerTable, DataReceiver, DataSender, MessageConsumer, MulticastSender, Pollable,
        ReplySender,
    },
    deferred::{ConnectionObservers, DeferredJob, DeferredQueue},
    error::{Error, ErrorKind, Result},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    pub addr: SocketAddr,
    #[serde_inline_default(Duration::from_millis(500))]
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
    #[serde_inline_default(256)]
    pub send_queue: usize,
    #[serde_inline_default(1024)]
    pub deferred_capacity: usize,
}

impl GateConfig {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        serde_json::from_value(serde_json::json!({ "addr": addr })).unwrap()
    }
}

/// Connection state of the gateway link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    /// Connected with the current transport session id. The session id is
    /// minted per connection attempt; the adaptor's logical peer id never
    /// changes.
    Connected { session: PeerId },
    Reconnecting,
}

struct GateCore {
    peer: PeerId,
    district: String,
    registry: Arc<Registry>,
    config: GateConfig,
    consumers: ConsumerTable<u32>,
    deferred: DeferredQueue,
    observers: ConnectionObservers,
    state: parking_lot::Mutex<ConnState>,
    out_tx: parking_lot::Mutex<Option<mpsc::Sender<Bytes>>>,
    supervisor: TaskSupervisor,
}

/// Gateway transport adaptor.
///
/// Poll-driven: inbound messages and connection notifications accumulate on
/// background tasks and consumer callbacks run only inside [`poll`]. Sends
/// while the link is down are dropped with an error; the gateway is a
/// best-effort direct transport, not a durable one.
///
/// [`poll`]: Pollable::poll
pub struct GateAdaptor {
    core: Arc<GateCore>,
}

impl GateAdaptor {
    #[must_use]
    pub fn new(config: GateConfig, registry: Arc<Registry>) -> Self {
        Self {
            core: Arc::new(GateCore {
                peer: PeerId::random(),
                district: registry.district().to_string(),
                registry,
                deferred: DeferredQueue::new(config.deferred_capacity),
                config,
                consumers: ConsumerTable::default(),
                observers: ConnectionObservers::default(),
                state: parking_lot::Mutex::new(ConnState::Disconnected),
                out_tx: parking_lot::Mutex::new(None),
                supervisor: TaskSupervisor::new(),
            }),
        }
    }

    #[must_use]
    pub fn observers(&self) -> &ConnectionObservers {
        &self.core.observers
    }

    #[must_use]
    pub fn conn_state(&self) -> ConnState {
        *self.core.state.lock()
    }

    /// Asks the gateway to forward `service` traffic for `dst` to this peer.
    pub fn subscribe_peer(&self, rule: &RoutingRule, dst: PeerId) -> Result<()> {
        let service_id = rule.gate.service_id(&self.core.district);
        self.core
            .try_send(codec::encode_control(GateMessage::Subscribe, service_id, dst))
    }

    /// Adds `dst` to a multicast forward group.
    pub fn add_forward(&self, dst: PeerId, group: u32) -> Result<()> {
        self.core
            .try_send(codec::encode_control(GateMessage::AddForward, group, dst))
    }

    /// Removes `dst` from a multicast forward group.
    pub fn remove_forward(&self, dst: PeerId, group: u32) -> Result<()> {
        self.core
            .try_send(codec::encode_control(GateMessage::RemoveForward, group, dst))
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

impl GateCore {
    /// Consumer tables are keyed by the numeric id the routing rule computes.
    fn gate_id(&self, service_id: &str) -> Result<u32> {
        let rule = self.registry.routing_rule(service_id)?;
        Ok(rule.gate.service_id(&self.district))
    }

    fn try_send(&self, wire: Bytes) -> Result<()> {
        let out_tx = self.out_tx.lock();
        let Some(tx) = out_tx.as_ref() else {
            return Err(Error::kind(ErrorKind::NotConnected));
        };
        tx.try_send(wire)
            .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))
    }

    async fn run(self: Arc<Self>) {
        let guard = self.supervisor.start_task();
        loop {
            {
                let mut state = self.state.lock();
                *state = if *state == ConnState::Disconnected {
                    ConnState::Connecting
                } else {
                    ConnState::Reconnecting
                };
            }

            match TcpStream::connect(self.config.addr).await {
                Ok(stream) => {
                    let session = PeerId::random();
                    *self.state.lock() = ConnState::Connected { session };
                    tracing::info!("gate connected to {}, session {session}", self.config.addr);

                    let (read_half, write_half) = stream.into_split();
                    let (tx, rx) = mpsc::channel(self.config.send_queue);
                    *self.out_tx.lock() = Some(tx);

                    // the handshake re-announces the stable logical peer id
                    let _ = self.try_send(codec::encode_handshake(self.peer));
                    self.deferred.push(DeferredJob::Connected);

                    let send_guard = self.supervisor.start_task();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = send_guard.stopped() => {}
                            r = Self::send_loop(write_half, rx) => {
                                if let Err(e) = r {
                                    tracing::debug!("gate send loop ended: {e}");
                                }
                            }
                        }
                    });

                    tokio::select! {
                        () = guard.stopped() => return,
                        r = self.recv_loop(read_half) => {
                            if let Err(e) = r {
                                tracing::error!("gate recv loop failed: {e}");
                            }
                        }
                    }

                    *self.out_tx.lock() = None;
                    *self.state.lock() = ConnState::Disconnected;
                    self.deferred.push(DeferredJob::Disconnected);
                }
                Err(e) => {
                    let error = Error::new(ErrorKind::ConnectFailed, e.to_string());
                    tracing::error!("gate connect to {} failed: {error}", self.config.addr);
                    self.deferred.push(DeferredJob::ConnectFailed(error));
                }
            }

            tokio::select! {
                () = guard.stopped() => return,
                () = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }
    }

    async fn send_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) -> Result<()> {
        while let Some(bytes) = rx.recv().await {
            write_half
                .write_all(&bytes)
                .await
                .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))?;
        }
        Ok(())
    }

    async fn recv_loop(self: &Arc<Self>, mut read_half: OwnedReadHalf) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(64 << 10);
        loop {
            if let Some(frame) = codec::split_frame(&mut buffer)? {
                self.handle_frame(frame);
            } else {
                let n = read_half
                    .read_buf(&mut buffer)
                    .await
                    .map_err(|e| Error::new(ErrorKind::RecvFailed, e.to_string()))?;
                if n == 0 {
                    return Err(Error::new(ErrorKind::RecvFailed, "gate eof".to_string()));
                }
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, mut frame: Bytes) {
        if frame.is_empty() {
            return;
        }
        match GateMessage::from_u8(frame.get_u8()) {
            Some(GateMessage::Received) => match codec::parse_received(frame) {
                Ok((service_id, mode, inner)) => {
                    let Some(consumer) = self.consumers.route(mode, &service_id) else {
                        tracing::debug!("no consumer for gate service {service_id} ({mode:?})");
                        return;
                    };
                    let reply: Option<Arc<dyn ReplySender>> = if mode.expects_reply() {
                        Some(Arc::new(GateReply { core: self.clone() }))
                    } else {
                        None
                    };
                    self.deferred.push(DeferredJob::Message {
                        consumer,
                        mode,
                        buf: inner,
                        reply,
                    });
                }
                Err(e) => tracing::error!("malformed gate envelope: {e}"),
            },
            Some(tag) => tracing::debug!("ignoring gate message {tag:?}"),
            None => tracing::warn!("unknown gate message tag"),
        }
    }
}

struct GateReply {
    core: Arc<GateCore>,
}

impl ReplySender for GateReply {
    fn send_reply(&self, buf: Bytes, dst: PeerId, rule: &RoutingRule) {
        let service_id = rule.gate.service_id(&self.core.district);
        let wire = codec::encode_unicast(dst, service_id, Mode::Return, &buf);
        if let Err(e) = self.core.try_send(wire) {
            tracing::warn!("gate return to {dst} dropped: {e}");
        }
    }
}

impl DataSender for GateAdaptor {
    fn peer_id(&self) -> PeerId {
        self.core.peer
    }

    fn register_delegate(
        &self,
        consumer: Arc<dyn MessageConsumer>,
        service_id: &str,
    ) -> Result<()> {
        let gate_id = self.core.gate_id(service_id)?;
        self.core.consumers.set_delegate(gate_id, consumer);
        Ok(())
    }

    fn send(&self, buf: Bytes, mode: Mode, dst: Option<PeerId>, rule: &RoutingRule) -> Result<()> {
        let service_id = rule.gate.service_id(&self.core.district);
        let dst = dst.unwrap_or_else(PeerId::nil);
        let wire = codec::encode_unicast(dst, service_id, mode, &buf);
        self.core.try_send(wire).inspect_err(|e| {
            tracing::warn!("gate send dropped ({}): {e}", self.core.config.addr);
        })
    }
}

impl DataReceiver for GateAdaptor {
    fn register_impl(&self, consumer: Arc<dyn MessageConsumer>, service_id: &str) -> Result<()> {
        let gate_id = self.core.gate_id(service_id)?;
        self.core.consumers.set_impl(gate_id, consumer);
        Ok(())
    }

    fn begin_receive(&self) -> Result<()> {
        if !self.core.supervisor.begin() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "gate receive loop already started".to_string(),
            ));
        }
        tokio::spawn(self.core.clone().run());
        Ok(())
    }
}

impl MulticastSender for GateAdaptor {
    fn multicast_send(
        &self,
        buf: Bytes,
        mode: Mode,
        forward_id: u32,
        rule: &RoutingRule,
    ) -> Result<()> {
        let service_id = rule.gate.service_id(&self.core.district);
        let wire = codec::encode_multicast(forward_id, service_id, mode, &buf);
        self.core.try_send(wire)
    }
}

impl Pollable for GateAdaptor {
    fn poll(&self) {
        self.core.deferred.drain(&self.core.observers);
    }
}

impl std::fmt::Debug for GateAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateAdaptor")
            .field("peer", &self.core.peer)
            .field("addr", &self.core.config.addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let config = GateConfig::new(addr);
        assert_eq!(config.addr, addr);
        assert_eq!(config.reconnect_backoff, Duration::from_millis(500));
        assert_eq!(config.send_queue, 256);

        let parsed: GateConfig = serde_json::from_str(
            r#"{ "addr": "127.0.0.1:7000", "reconnect_backoff": "2s" }"#,
        )
        .unwrap();
        assert_eq!(parsed.reconnect_backoff, Duration::from_secs(2));
    }
}
