use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

/// One replicated change, produced by a modification iterator and consumed
/// by a remote coordinator's `apply_replication`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEntry {
    pub key: String,
    /// Absent for deletions
    pub value: Option<Vec<u8>>,
    /// Wall-clock timestamp of the change, milliseconds since epoch
    pub timestamp: i64,
    /// Identifier of the node that produced the change
    pub origin: u8,
    pub deleted: bool,
    /// Timestamp a reconnecting peer should declare to resume from
    pub bootstrap_timestamp: i64,
}

/// Per-remote-peer replication bookkeeping.
///
/// Created lazily on first iterator acquisition for that identifier and
/// kept for the coordinator's lifetime. All fields are read without
/// synchronization barriers; worst-case staleness means redundant bootstrap
/// data, never lost data.
#[derive(Debug, Default)]
pub struct RemoteNodeState {
    /// Monotonic high-water mark of changes known applied by the peer
    last_modification_time: AtomicI64,
    /// Timestamp handed out on the peer's last bootstrap
    last_bootstrap_timestamp: AtomicI64,
    /// Fresh candidate bootstrap timestamp; 0 = unset
    next_bootstrap_timestamp: AtomicI64,
}

impl RemoteNodeState {
    pub fn last_modification_time(&self) -> i64 {
        self.last_modification_time.load(Ordering::Relaxed)
    }

    pub fn set_last_modification_time(&self, t: i64) {
        self.last_modification_time.fetch_max(t, Ordering::Relaxed);
    }

    pub fn last_bootstrap_timestamp(&self) -> i64 {
        self.last_bootstrap_timestamp.load(Ordering::Relaxed)
    }

    /// Propose a fresh bootstrap timestamp (set when a drain pass found
    /// nothing to replicate)
    pub fn propose_bootstrap_timestamp(&self, t: i64) {
        self.next_bootstrap_timestamp.store(t, Ordering::Relaxed);
    }

    /// Invalidate the proposed bootstrap timestamp (a new change landed)
    pub fn invalidate_bootstrap_timestamp(&self) {
        self.next_bootstrap_timestamp.store(0, Ordering::Relaxed);
    }

    /// The timestamp a reconnecting peer should pass to `dirty_entries`:
    /// promotes the fresh candidate when one exists, otherwise repeats the
    /// previous answer. Deliberately lags "now" to tolerate out-of-order
    /// delivery from the bitset scan.
    pub fn bootstrap_timestamp(&self) -> i64 {
        let next = self.next_bootstrap_timestamp.swap(0, Ordering::Relaxed);
        if next != 0 {
            self.last_bootstrap_timestamp.store(next, Ordering::Relaxed);
            next
        } else {
            self.last_bootstrap_timestamp.load(Ordering::Relaxed)
        }
    }

    /// Reset all bootstrap state (first iterator acquisition)
    pub fn reset(&self) {
        self.last_bootstrap_timestamp.store(0, Ordering::Relaxed);
        self.next_bootstrap_timestamp.store(0, Ordering::Relaxed);
    }
}

/// Replication statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicationStats {
    /// Entries handed to per-peer consumers
    pub entries_sent: u64,
    /// Remote entries applied locally
    pub entries_applied: u64,
    /// Remote entries rejected by conflict resolution
    pub entries_rejected: u64,
    /// Peers with an acquired modification iterator
    pub known_peers: usize,
}

/// Replication error types
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Invalid peer identifier: {0}")]
    InvalidIdentifier(u8),

    #[error("Invalid replication configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Unexpected command during handshake: {0}")]
    UnexpectedCommand(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl From<bincode::Error> for ReplicationError {
    fn from(e: bincode::Error) -> Self {
        ReplicationError::SerializationError(e.to_string())
    }
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;
