//! Multi-master replication over per-entry dirty bits.
//!
//! Every stored entry carries a timestamp, an origin identifier and one
//! dirty bit per possible peer. Local changes raise the bit for every
//! acquired peer; a per-peer [`ModificationIterator`] drains raised bits
//! and clears them after delivery. Remote entries are applied through
//! deterministic last-writer-wins conflict resolution, so any two nodes
//! seeing the same set of changes converge on the same data.

pub mod config;
pub mod coordinator;
pub mod iterator;
pub mod sync;
pub mod types;

pub use config::ReplicationConfig;
pub use coordinator::ReplicationCoordinator;
pub use iterator::ModificationIterator;
pub use types::{
    RemoteNodeState, ReplicationEntry, ReplicationError, ReplicationResult, ReplicationStats,
};

#[cfg(test)]
mod tests;
