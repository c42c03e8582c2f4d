//! Coordination-service binding: data-node messaging and leader election.
//!
//! The adaptor speaks to any hierarchical coordination service through
//! [`CoordClient`]; the in-process [`MemoryCoord`] implements it for tests
//! and single-process deployments.

mod client;
pub use client::{CoordClient, CoordHandle, CreateMode};

mod election;
pub use election::ElectionState;

mod coord_adaptor;
pub use coord_adaptor::{CoordAdaptor, CoordConfig};

mod memory_coord;
pub use memory_coord::MemoryCoord;
