use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{CoordClient, CoordHandle, CreateMode};
use crate::error::{Error, ErrorKind, Result};

#[derive(Clone, Debug)]
enum PathEvent {
    Data(Bytes),
    Deleted,
}

struct NodeState {
    data: Bytes,
    owner: Option<String>,
}

#[derive(Default)]
struct CoordInner {
    nodes: Mutex<HashMap<String, NodeState>>,
    // parent path -> next sequence number
    counters: Mutex<HashMap<String, u32>>,
    channels: Mutex<HashMap<String, broadcast::Sender<PathEvent>>>,
    sessions: Mutex<HashSet<String>>,
}

/// In-process coordination service: a node tree with ephemeral ownership,
/// sequence suffixes and path watches.
///
/// `kill_session` expires one session, deleting its ephemeral nodes the way
/// a real coordination service would on session loss. That makes election
/// failover testable in-process.
#[derive(Clone, Default)]
pub struct MemoryCoord(Arc<CoordInner>);

impl MemoryCoord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill_session(&self, client_id: &str) {
        self.0.sessions.lock().remove(client_id);
        let orphaned: Vec<String> = {
            let mut nodes = self.0.nodes.lock();
            let paths: Vec<String> = nodes
                .iter()
                .filter(|(_, state)| state.owner.as_deref() == Some(client_id))
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                nodes.remove(path);
            }
            paths
        };
        for path in orphaned {
            self.0.emit(&path, PathEvent::Deleted);
        }
    }

    #[must_use]
    pub fn node_exists(&self, path: &str) -> bool {
        self.0.nodes.lock().contains_key(path)
    }
}

impl CoordInner {
    fn channel(&self, path: &str) -> broadcast::Sender<PathEvent> {
        self.channels
            .lock()
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(32).0)
            .clone()
    }

    fn emit(&self, path: &str, event: PathEvent) {
        if let Some(tx) = self.channels.lock().get(path) {
            let _ = tx.send(event);
        }
    }
}

fn parent_of(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

struct MemoryCoordHandle {
    inner: Arc<CoordInner>,
    client_id: String,
}

impl MemoryCoordHandle {
    fn check_session(&self) -> Result<()> {
        if self.inner.sessions.lock().contains(&self.client_id) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::SessionExpired,
                format!("session {} expired", self.client_id),
            ))
        }
    }
}

#[async_trait]
impl CoordHandle for MemoryCoordHandle {
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<String> {
        self.check_session()?;
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => {
                Some(self.client_id.clone())
            }
        };
        let final_path = {
            let mut nodes = self.inner.nodes.lock();
            let parent = parent_of(path);
            if !parent.is_empty() && !nodes.contains_key(parent) {
                return Err(Error::new(
                    ErrorKind::NoNode,
                    format!("parent of {path} does not exist"),
                ));
            }
            let final_path = if mode == CreateMode::EphemeralSequential {
                let mut counters = self.inner.counters.lock();
                let seq = counters.entry(parent.to_string()).or_default();
                let assigned = *seq;
                *seq += 1;
                format!("{path}{assigned:010}")
            } else {
                if nodes.contains_key(path) {
                    return Err(Error::new(
                        ErrorKind::NodeExists,
                        format!("node {path} already exists"),
                    ));
                }
                path.to_string()
            };
            nodes.insert(final_path.clone(), NodeState { data, owner });
            final_path
        };
        Ok(final_path)
    }

    async fn set_data(&self, path: &str, data: Bytes) -> Result<()> {
        self.check_session()?;
        {
            let mut nodes = self.inner.nodes.lock();
            let state = nodes.get_mut(path).ok_or_else(|| {
                Error::new(ErrorKind::NoNode, format!("node {path} does not exist"))
            })?;
            state.data = data.clone();
        }
        self.inner.emit(path, PathEvent::Data(data));
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Bytes> {
        self.check_session()?;
        self.inner
            .nodes
            .lock()
            .get(path)
            .map(|state| state.data.clone())
            .ok_or_else(|| Error::new(ErrorKind::NoNode, format!("node {path} does not exist")))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check_session()?;
        let prefix = format!("{path}/");
        let children = self
            .inner
            .nodes
            .lock()
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        Ok(children)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_session()?;
        if self.inner.nodes.lock().remove(path).is_none() {
            return Err(Error::new(
                ErrorKind::NoNode,
                format!("node {path} does not exist"),
            ));
        }
        self.inner.emit(path, PathEvent::Deleted);
        Ok(())
    }

    async fn wait_deleted(&self, path: &str) -> Result<()> {
        self.check_session()?;
        // subscribe before the existence check so a concurrent delete
        // cannot slip between them
        let mut rx = self.inner.channel(path).subscribe();
        if !self.inner.nodes.lock().contains_key(path) {
            return Ok(());
        }
        loop {
            match rx.recv().await {
                Ok(PathEvent::Deleted) => return Ok(()),
                Ok(PathEvent::Data(_)) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if !self.inner.nodes.lock().contains_key(path) {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::kind(ErrorKind::SessionExpired));
                }
            }
            self.check_session()?;
        }
    }

    async fn await_data(&self, path: &str) -> Result<Bytes> {
        self.check_session()?;
        let mut rx = self.inner.channel(path).subscribe();
        loop {
            match rx.recv().await {
                Ok(PathEvent::Data(data)) => return Ok(data),
                Ok(PathEvent::Deleted) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::kind(ErrorKind::SessionExpired));
                }
            }
            self.check_session()?;
        }
    }
}

#[async_trait]
impl CoordClient for MemoryCoord {
    async fn connect(&self, client_id: &str) -> Result<Arc<dyn CoordHandle>> {
        self.0.sessions.lock().insert(client_id.to_string());
        Ok(Arc::new(MemoryCoordHandle {
            inner: self.0.clone(),
            client_id: client_id.to_string(),
        }))
    }
}
