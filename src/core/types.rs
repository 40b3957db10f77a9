use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of dirty-bit lanes per entry: one per possible peer identifier
/// (0..=127) plus reserved lanes.
pub const DIRTY_BIT_LANES: usize = 135;

const DIRTY_WORDS: usize = DIRTY_BIT_LANES.div_ceil(64);

/// Highest assignable peer identifier (identifiers are a single byte with
/// the top bit reserved).
pub const MAX_IDENTIFIER: u8 = 127;

/// Fixed-width bitset with one bit per possible peer identifier.
///
/// Bit `i` is set iff the owning entry has a pending, undelivered change for
/// peer `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyBits {
    words: [u64; DIRTY_WORDS],
}

impl DirtyBits {
    /// Empty bitset (no peer needs this entry)
    pub const fn none() -> Self {
        Self {
            words: [0; DIRTY_WORDS],
        }
    }

    /// Raise the bit for one peer
    pub fn set(&mut self, peer: u8) {
        let i = peer as usize;
        debug_assert!(i < DIRTY_BIT_LANES);
        self.words[i / 64] |= 1 << (i % 64);
    }

    /// Clear the bit for one peer
    pub fn clear(&mut self, peer: u8) {
        let i = peer as usize;
        debug_assert!(i < DIRTY_BIT_LANES);
        self.words[i / 64] &= !(1 << (i % 64));
    }

    /// Check whether the bit for one peer is raised
    pub fn is_set(&self, peer: u8) -> bool {
        let i = peer as usize;
        debug_assert!(i < DIRTY_BIT_LANES);
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    /// True when no bit is raised
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of raised bits
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Per-entry replication metadata, co-located with every stored value.
///
/// Mutated only through the store's replace-if-equal commits; the whole
/// record is compared for equality, never partially updated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicationData {
    /// Wall-clock timestamp of the last change, milliseconds since epoch
    pub timestamp: i64,
    /// Identifier of the node that produced the last change
    pub origin: u8,
    /// Tombstone flag
    pub deleted: bool,
    /// Per-peer undelivered-change bits
    pub dirty: DirtyBits,
}

/// One stored entry: the value (absent for tombstones) plus its replication
/// metadata.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub value: Option<Vec<u8>>,
    pub meta: ReplicationData,
}

impl StoredEntry {
    pub fn live(value: Vec<u8>) -> Self {
        Self {
            value: Some(value),
            meta: ReplicationData::default(),
        }
    }

    /// True when this entry is a deletion marker kept only for its metadata
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Configuration for the segmented store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of segments (shards); key space is hashed across them
    pub segments: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { segments: 16 }
    }
}

/// Statistics for the segmented store
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    /// Live (non-tombstone) keys
    pub total_keys: usize,
    /// Tombstones retained for replication metadata
    pub tombstones: usize,
    /// Number of read operations
    pub gets: u64,
    /// Number of write operations
    pub puts: u64,
    /// Number of removals
    pub removes: u64,
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
