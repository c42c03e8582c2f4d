use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Node lifetime semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Deleted automatically when the owning session ends.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing sequence suffix assigned
    /// atomically at creation.
    EphemeralSequential,
}

/// One session on a hierarchical coordination service.
///
/// Session loss is surfaced as `ErrorKind::SessionExpired` from any
/// operation; the handle does not reconnect on its own.
#[async_trait]
pub trait CoordHandle: Send + Sync {
    /// Creates a node and returns its final path (sequence suffix included
    /// for [`CreateMode::EphemeralSequential`]). Fails with
    /// `ErrorKind::NodeExists` when a non-sequential node is already there
    /// and `ErrorKind::NoNode` when the parent is missing.
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<String>;

    async fn set_data(&self, path: &str, data: Bytes) -> Result<()>;
    async fn get_data(&self, path: &str) -> Result<Bytes>;
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;
    async fn delete(&self, path: &str) -> Result<()>;

    /// Resolves once `path` is absent; immediately when it already is.
    async fn wait_deleted(&self, path: &str) -> Result<()>;

    /// Resolves with the payload of the next data write to `path`.
    async fn await_data(&self, path: &str) -> Result<Bytes>;
}

/// Connection factory for a coordination-service substrate.
#[async_trait]
pub trait CoordClient: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<Arc<dyn CoordHandle>>;
}
