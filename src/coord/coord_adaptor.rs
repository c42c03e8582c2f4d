use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::DropGuard;

use super::{
    CoordClient, CoordHandle, CreateMode,
    election::{ElectionState, RoundHandle, path_to_seq, transition},
};
use crate::{
    Envelope, Mode, PeerId, Registry, RoutingRule, TaskSupervisor,
    adaptor::{ConsumerTable, DataReceiver, DataSender, MessageConsumer, Pollable},
    deferred::{ConnectionObservers, DeferredJob, DeferredQueue},
    error::{Error, ErrorKind, Result},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CoordConfig {
    /// Node-tree root this process provisions under.
    #[serde_inline_default("/rpc".to_string())]
    pub root: String,
    #[serde_inline_default(256)]
    pub send_queue: usize,
    #[serde_inline_default(1024)]
    pub deferred_capacity: usize,
}

impl Default for CoordConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(Default::default())).unwrap()
    }
}

#[derive(Default)]
struct WatchState {
    pending: Vec<String>,
    active: HashSet<String>,
}

struct CoordCore {
    peer: PeerId,
    district: String,
    registry: Arc<Registry>,
    client: Arc<dyn CoordClient>,
    config: CoordConfig,
    consumers: ConsumerTable<String>,
    handle: Mutex<Option<Arc<dyn CoordHandle>>>,
    watches: Mutex<WatchState>,
    watch_added: Notify,
    out_tx: Mutex<Option<mpsc::Sender<(String, Bytes)>>>,
    deferred: DeferredQueue,
    observers: ConnectionObservers,
    elections: Mutex<HashMap<String, Arc<RoundHandle>>>,
    session_dead: AtomicBool,
    supervisor: TaskSupervisor,
}

/// Coordination-service binding.
///
/// Messaging flows through data nodes: `send` writes the service node and
/// watchers receive the write as an inbound message (there is no reverse
/// path, so consumers never get a reply sender). The same session carries
/// leader election. Unlike the broker bindings this one does not reconnect:
/// the substrate client owns session recovery, and a lost session surfaces
/// as `SessionExpired` from every subsequent operation.
pub struct CoordAdaptor {
    core: Arc<CoordCore>,
}

impl CoordAdaptor {
    #[must_use]
    pub fn new(
        client: Arc<dyn CoordClient>,
        config: CoordConfig,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            core: Arc::new(CoordCore {
                peer: PeerId::random(),
                district: registry.district().to_string(),
                registry,
                client,
                deferred: DeferredQueue::new(config.deferred_capacity),
                config,
                consumers: ConsumerTable::default(),
                handle: Mutex::new(None),
                watches: Mutex::default(),
                watch_added: Notify::new(),
                out_tx: Mutex::new(None),
                observers: ConnectionObservers::default(),
                elections: Mutex::default(),
                session_dead: AtomicBool::new(false),
                supervisor: TaskSupervisor::new(),
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

    /// Joins the named election round: provisions the round path, creates
    /// this participant's ephemeral sequential member node and starts the
    /// watch task. Idempotent per round.
    pub async fn identity(&self, round: &str) -> Result<()> {
        let handle = self.core.current_handle()?;
        let flag = {
            let mut elections = self.core.elections.lock();
            if elections.contains_key(round) {
                return Ok(());
            }
            let flag = RoundHandle::new();
            elections.insert(round.to_string(), flag.clone());
            flag
        };

        let round_path = format!("{}/rounds/{round}", self.core.config.root);
        let joined = self.join_round(&handle, &round_path).await;
        let self_seq = match joined {
            Ok(seq) => seq,
            Err(e) => {
                // half-joined rounds must not shadow a later retry
                self.core.elections.lock().remove(round);
                return Err(e);
            }
        };
        tracing::info!("joined round {round} with seq {self_seq}");

        tokio::spawn(Self::election_loop(
            self.core.clone(),
            handle,
            round_path,
            self_seq,
            flag,
        ));
        Ok(())
    }

    async fn join_round(&self, handle: &Arc<dyn CoordHandle>, round_path: &str) -> Result<u32> {
        ensure_path(handle.as_ref(), round_path).await?;
        let member = handle
            .create(
                &format!("{round_path}/member-"),
                Bytes::copy_from_slice(self.core.peer.as_bytes()),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let name = member.rsplit('/').next().unwrap_or(&member);
        path_to_seq(name).ok_or_else(|| {
            Error::new(
                ErrorKind::ParseFailed,
                format!("unparsable member node {member}"),
            )
        })
    }

    /// Cached leadership state; never performs a round-trip.
    pub fn is_leader(&self, round: &str) -> Result<bool> {
        self.core
            .elections
            .lock()
            .get(round)
            .map(|flag| flag.is_leader())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NoSuchRound,
                    format!("not a participant of round {round}"),
                )
            })
    }

    async fn election_loop(
        core: Arc<CoordCore>,
        handle: Arc<dyn CoordHandle>,
        round_path: String,
        self_seq: u32,
        flag: Arc<RoundHandle>,
    ) {
        let guard = core.supervisor.start_task();
        loop {
            // always a fresh listing: the watched predecessor relationship
            // may not have survived whatever woke us
            let children = match handle.get_children(&round_path).await {
                Ok(children) => children,
                Err(e) => {
                    tracing::error!("listing {round_path} failed: {e}");
                    flag.set_leader(false);
                    core.session_lost();
                    return;
                }
            };
            let live: Vec<(u32, String)> = children
                .into_iter()
                .filter_map(|child| path_to_seq(&child).map(|seq| (seq, child)))
                .collect();
            let seqs: Vec<u32> = live.iter().map(|(seq, _)| *seq).collect();

            match transition(self_seq, &seqs) {
                ElectionState::Leader => {
                    flag.set_leader(true);
                    tracing::info!("leading {round_path} with seq {self_seq}");
                    return;
                }
                ElectionState::Watching { predecessor } => {
                    flag.set_leader(false);
                    let Some((_, name)) = live.iter().find(|(seq, _)| *seq == predecessor)
                    else {
                        continue;
                    };
                    let pred_path = format!("{round_path}/{name}");
                    tracing::debug!("watching {pred_path} from seq {self_seq}");
                    tokio::select! {
                        () = guard.stopped() => return,
                        r = handle.wait_deleted(&pred_path) => {
                            if let Err(e) = r {
                                tracing::error!("watch on {pred_path} failed: {e}");
                                core.session_lost();
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

impl CoordCore {
    fn current_handle(&self) -> Result<Arc<dyn CoordHandle>> {
        if self.session_dead.load(Ordering::Acquire) {
            return Err(Error::kind(ErrorKind::SessionExpired));
        }
        self.handle
            .lock()
            .clone()
            .ok_or_else(|| Error::kind(ErrorKind::NotConnected))
    }

    fn session_lost(&self) {
        if !self.session_dead.swap(true, Ordering::AcqRel) {
            *self.out_tx.lock() = None;
            self.deferred.push(DeferredJob::Disconnected);
        }
    }

    fn queue_watch(&self, path: String) {
        {
            let mut watches = self.watches.lock();
            if watches.active.contains(&path) || watches.pending.contains(&path) {
                return;
            }
            watches.pending.push(path);
        }
        self.watch_added.notify_one();
    }

    async fn run(self: Arc<Self>) {
        let guard = self.supervisor.start_task();
        let client_id = self.peer.to_string();
        let handle = match self.client.connect(&client_id).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("coordination connect failed: {e}");
                self.deferred.push(DeferredJob::ConnectFailed(e));
                return;
            }
        };
        if let Err(e) = ensure_path(handle.as_ref(), &self.config.root).await {
            tracing::error!("provisioning {} failed: {e}", self.config.root);
            self.deferred.push(DeferredJob::ConnectFailed(e));
            return;
        }
        *self.handle.lock() = Some(handle.clone());

        let (tx, rx) = mpsc::channel(self.config.send_queue);
        *self.out_tx.lock() = Some(tx);
        let writer_guard = self.supervisor.start_task();
        let writer_core = self.clone();
        let writer_handle = handle.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = writer_guard.stopped() => {}
                () = writer_core.write_loop(writer_handle, rx) => {}
            }
        });

        self.deferred.push(DeferredJob::Connected);
        tracing::info!("coordination session established under {}", self.config.root);

        loop {
            let path = { self.watches.lock().pending.pop() };
            match path {
                Some(path) => {
                    if let Err(e) = ensure_path(handle.as_ref(), &path).await {
                        tracing::error!("provisioning {path} failed: {e}");
                        continue;
                    }
                    self.watches.lock().active.insert(path.clone());
                    tokio::spawn(Self::watch_loop(self.clone(), handle.clone(), path));
                }
                None => {
                    tokio::select! {
                        () = guard.stopped() => return,
                        () = self.watch_added.notified() => {}
                    }
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        handle: Arc<dyn CoordHandle>,
        mut rx: mpsc::Receiver<(String, Bytes)>,
    ) {
        while let Some((path, wire)) = rx.recv().await {
            match handle.set_data(&path, wire.clone()).await {
                Ok(()) => {}
                Err(e) if e.kind == ErrorKind::NoNode => {
                    // first write to a not-yet-provisioned service node
                    let retry = ensure_path(handle.as_ref(), &path).await;
                    let retry = match retry {
                        Ok(()) => handle.set_data(&path, wire).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = retry {
                        tracing::error!("write to {path} failed: {e}");
                    }
                }
                Err(e) => {
                    tracing::error!("write to {path} failed: {e}");
                    if e.kind == ErrorKind::SessionExpired {
                        self.session_lost();
                        return;
                    }
                }
            }
        }
    }

    async fn watch_loop(self: Arc<Self>, handle: Arc<dyn CoordHandle>, path: String) {
        let guard = self.supervisor.start_task();
        loop {
            tokio::select! {
                () = guard.stopped() => return,
                r = handle.await_data(&path) => match r {
                    Ok(data) => self.handle_data(&path, data),
                    Err(e) => {
                        tracing::error!("watch on {path} ended: {e}");
                        self.session_lost();
                        return;
                    }
                }
            }
        }
    }

    fn handle_data(&self, path: &str, data: Bytes) {
        let (envelope, inner) = match Envelope::unwrap(data) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!("malformed envelope on {path}: {e}");
                return;
            }
        };
        let Some(consumer) = self.consumers.route(envelope.mode, &envelope.service_id) else {
            tracing::debug!(
                "no consumer for {} ({:?}) on {path}",
                envelope.service_id,
                envelope.mode
            );
            return;
        };
        // data-node messaging has no reverse path
        self.deferred.push(DeferredJob::Message {
            consumer,
            mode: envelope.mode,
            buf: inner,
            reply: None,
        });
    }
}

/// Creates every component of `path` as a persistent node, treating
/// node-exists as success.
async fn ensure_path(handle: &dyn CoordHandle, path: &str) -> Result<()> {
    let mut current = String::with_capacity(path.len());
    for part in path.split('/').filter(|part| !part.is_empty()) {
        current.push('/');
        current.push_str(part);
        match handle
            .create(&current, Bytes::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind == ErrorKind::NodeExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl DataSender for CoordAdaptor {
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
        let path = rule.coord.service_path(&self.core.district);
        if !path.is_empty() {
            self.core.queue_watch(path);
        }
        Ok(())
    }

    fn send(&self, buf: Bytes, mode: Mode, _dst: Option<PeerId>, rule: &RoutingRule) -> Result<()> {
        let path = rule.coord.service_path(&self.core.district);
        if path.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("no service path for service {}", rule.service_id),
            ));
        }
        if self.core.session_dead.load(Ordering::Acquire) {
            return Err(Error::kind(ErrorKind::SessionExpired));
        }
        let envelope = Envelope {
            mode,
            service_id: rule.service_id.clone(),
        };
        let wire = envelope.wrap(&buf)?;
        let out_tx = self.core.out_tx.lock();
        let Some(tx) = out_tx.as_ref() else {
            return Err(Error::kind(ErrorKind::NotConnected));
        };
        tx.try_send((path, wire))
            .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))
    }
}

impl DataReceiver for CoordAdaptor {
    fn register_impl(&self, consumer: Arc<dyn MessageConsumer>, service_id: &str) -> Result<()> {
        let rule = self.core.registry.routing_rule(service_id)?;
        self.core
            .consumers
            .set_impl(service_id.to_string(), consumer);
        let path = rule.coord.service_path(&self.core.district);
        if !path.is_empty() {
            self.core.queue_watch(path);
        }
        Ok(())
    }

    fn begin_receive(&self) -> Result<()> {
        if !self.core.supervisor.begin() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "coordination session already started".to_string(),
            ));
        }
        tokio::spawn(self.core.clone().run());
        Ok(())
    }
}

impl Pollable for CoordAdaptor {
    fn poll(&self) {
        self.core.deferred.drain(&self.core.observers);
    }
}

impl std::fmt::Debug for CoordAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordAdaptor")
            .field("peer", &self.core.peer)
            .field("root", &self.core.config.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CoordConfig::default();
        assert_eq!(config.root, "/rpc");
        assert_eq!(config.send_queue, 256);

        let parsed: CoordConfig = serde_json::from_str(r#"{ "root": "/game" }"#).unwrap();
        assert_eq!(parsed.root, "/game");
        assert_eq!(parsed.deferred_capacity, 1024);
    }
}
