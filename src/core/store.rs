use super::error::{InvalidSubscriber, MeshError, Result};
use super::types::{ReplicationData, StoreConfig, StoreStats, StoredEntry};
use ahash::RandomState;
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use std::hash::BuildHasher;
use std::sync::Arc;
use tracing::{debug, info};

/// The store collaborator contract consumed by the subscription and
/// replication layers.
///
/// Mutations report enough about the previous state for the caller to emit
/// the exact event type; `entries_for`/`keys_for` are synchronous push-style
/// iteration over one segment, aborted early when the callback returns
/// [`InvalidSubscriber`].
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Insert or overwrite without fetching the old value; returns whether a
    /// live previous value existed.
    fn put(&self, key: &str, value: Vec<u8>) -> bool;

    /// Insert or overwrite, returning the old value
    fn get_and_put(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>>;

    /// Remove without fetching the old value; returns whether a live value
    /// was removed.
    fn remove(&self, key: &str) -> bool;

    /// Remove, returning the old value
    fn get_and_remove(&self, key: &str) -> Option<Vec<u8>>;

    /// Insert only when absent; returns the existing value otherwise
    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>>;

    /// Overwrite only when present; returns the old value
    fn replace(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>>;

    /// Overwrite only when the current value equals `expected`
    fn replace_if_equal(&self, key: &str, expected: &[u8], value: Vec<u8>) -> bool;

    /// Remove only when the current value equals `expected`
    fn remove_if_equal(&self, key: &str, expected: &[u8]) -> bool;

    fn segments(&self) -> usize;

    /// Push every live entry of one segment to the callback
    fn entries_for(
        &self,
        segment: usize,
        f: &mut dyn FnMut(&str, &[u8]) -> std::result::Result<(), InvalidSubscriber>,
    ) -> std::result::Result<(), InvalidSubscriber>;

    /// Push every live key of one segment to the callback
    fn keys_for(
        &self,
        segment: usize,
        f: &mut dyn FnMut(&str) -> std::result::Result<(), InvalidSubscriber>,
    ) -> std::result::Result<(), InvalidSubscriber>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory segmented store: the key space is hashed across N segments,
/// each a radix trie behind its own lock.
///
/// Removals leave tombstones so per-entry [`ReplicationData`] survives
/// deletion; tombstones are invisible to reads and iteration and only the
/// replication engine sees them.
#[derive(Clone)]
pub struct SegmentedStore {
    segments: Arc<Vec<RwLock<Trie<String, StoredEntry>>>>,
    stats: Arc<RwLock<StoreStats>>,
    hasher: RandomState,
    config: StoreConfig,
}

impl SegmentedStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        if config.segments == 0 {
            return Err(MeshError::InvalidConfig(
                "segment count must be nonzero".to_string(),
            ));
        }

        info!("Initializing segmented store with {} segments", config.segments);

        let segments = (0..config.segments).map(|_| RwLock::new(Trie::new())).collect();

        Ok(Self {
            segments: Arc::new(segments),
            stats: Arc::new(RwLock::new(StoreStats::default())),
            hasher: RandomState::new(),
            config,
        })
    }

    fn segment_for(&self, key: &str) -> usize {
        self.hasher.hash_one(key) as usize % self.config.segments
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read the replication metadata for a key (tombstones included)
    pub fn replication_data(&self, key: &str) -> Option<ReplicationData> {
        let segment = self.segments[self.segment_for(key)].read();
        segment.get(key).map(|e| e.meta)
    }

    /// Replace-if-equal commit for a key's replication metadata.
    ///
    /// `expected` is the caller's snapshot (`None` for "no entry / never
    /// stamped"); the commit fails when the live metadata has diverged, and
    /// the caller re-runs its read-compute-commit cycle.
    pub fn compare_and_set_replication_data(
        &self,
        key: &str,
        expected: Option<ReplicationData>,
        new: ReplicationData,
    ) -> bool {
        let mut segment = self.segments[self.segment_for(key)].write();
        let current = segment.get(key).map(|e| e.meta);
        if current != expected {
            return false;
        }

        if let Some(entry) = segment.get_mut(key) {
            entry.meta = new;
        } else {
            // Entry vanished is impossible (removals tombstone), so an absent
            // key here was never written; keep the metadata on a tombstone.
            segment.insert(
                key.to_string(),
                StoredEntry {
                    value: None,
                    meta: new,
                },
            );
            self.stats.write().tombstones += 1;
        }
        true
    }

    /// Commit a remotely-replicated value and its metadata in one step, iff
    /// the current metadata still equals the caller's snapshot.
    pub fn apply_replicated_if(
        &self,
        key: &str,
        expected: Option<ReplicationData>,
        value: Option<Vec<u8>>,
        meta: ReplicationData,
    ) -> bool {
        let mut segment = self.segments[self.segment_for(key)].write();
        let current = segment.get(key).map(|e| e.meta);
        if current != expected {
            return false;
        }

        let was_live = segment.get(key).is_some_and(|e| !e.is_tombstone());
        let was_present = current.is_some();
        let is_live = value.is_some();
        segment.insert(key.to_string(), StoredEntry { value, meta });

        let mut stats = self.stats.write();
        match (was_live, is_live) {
            (false, true) => {
                stats.total_keys += 1;
                if was_present {
                    stats.tombstones = stats.tombstones.saturating_sub(1);
                }
            }
            (true, false) => {
                stats.total_keys = stats.total_keys.saturating_sub(1);
                stats.tombstones += 1;
            }
            (false, false) if !was_present => stats.tombstones += 1,
            _ => {}
        }
        true
    }

    /// Snapshot every entry in one segment whose dirty bit for `peer` is
    /// raised: `(key, value, metadata)` triples, taken under the read lock.
    pub fn dirty_snapshot(
        &self,
        segment: usize,
        peer: u8,
    ) -> Vec<(String, Option<Vec<u8>>, ReplicationData)> {
        let segment = self.segments[segment].read();
        segment
            .iter()
            .filter(|(_, e)| e.meta.dirty.is_set(peer))
            .map(|(k, e)| (k.clone(), e.value.clone(), e.meta))
            .collect()
    }

    /// Re-raise the dirty bit for `peer` on every entry in one segment whose
    /// timestamp is at or after `from_timestamp`; returns how many were
    /// raised.
    pub fn raise_dirty_since(&self, segment: usize, peer: u8, from_timestamp: i64) -> usize {
        let mut seg = self.segments[segment].write();
        let stale: Vec<String> = seg
            .iter()
            .filter(|(_, e)| e.meta.timestamp >= from_timestamp && !e.meta.dirty.is_set(peer))
            .map(|(k, _)| k.clone())
            .collect();

        let raised = stale.len();
        for key in stale {
            if let Some(entry) = seg.get_mut(&key) {
                entry.meta.dirty.set(peer);
            }
        }
        raised
    }

    /// Whether any entry in any segment has the dirty bit for `peer` raised
    pub fn has_dirty(&self, peer: u8) -> bool {
        self.segments.iter().any(|s| {
            s.read().iter().any(|(_, e)| e.meta.dirty.is_set(peer))
        })
    }
}

impl KeyValueStore for SegmentedStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let segment = self.segments[self.segment_for(key)].read();
        let value = segment.get(key).and_then(|e| e.value.clone());
        self.stats.write().gets += 1;
        value
    }

    fn put(&self, key: &str, value: Vec<u8>) -> bool {
        debug!("PUT key={}, size={}", key, value.len());
        let mut segment = self.segments[self.segment_for(key)].write();

        let (had_previous, revived_tombstone) = if let Some(entry) = segment.get_mut(key) {
            let was_tombstone = entry.is_tombstone();
            entry.value = Some(value);
            (!was_tombstone, was_tombstone)
        } else {
            segment.insert(key.to_string(), StoredEntry::live(value));
            (false, false)
        };

        let mut stats = self.stats.write();
        stats.puts += 1;
        if !had_previous {
            stats.total_keys += 1;
        }
        if revived_tombstone {
            stats.tombstones = stats.tombstones.saturating_sub(1);
        }
        had_previous
    }

    fn get_and_put(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        let mut segment = self.segments[self.segment_for(key)].write();

        let (old, revived_tombstone) = if let Some(entry) = segment.get_mut(key) {
            let was_tombstone = entry.is_tombstone();
            (entry.value.replace(value), was_tombstone)
        } else {
            segment.insert(key.to_string(), StoredEntry::live(value));
            (None, false)
        };

        let mut stats = self.stats.write();
        stats.puts += 1;
        if old.is_none() {
            stats.total_keys += 1;
        }
        if revived_tombstone {
            stats.tombstones = stats.tombstones.saturating_sub(1);
        }
        old
    }

    fn remove(&self, key: &str) -> bool {
        debug!("REMOVE key={}", key);
        let mut segment = self.segments[self.segment_for(key)].write();

        let removed = match segment.get_mut(key) {
            Some(entry) if !entry.is_tombstone() => {
                entry.value = None;
                true
            }
            _ => false,
        };

        if removed {
            let mut stats = self.stats.write();
            stats.removes += 1;
            stats.total_keys = stats.total_keys.saturating_sub(1);
            stats.tombstones += 1;
        }
        removed
    }

    fn get_and_remove(&self, key: &str) -> Option<Vec<u8>> {
        let mut segment = self.segments[self.segment_for(key)].write();

        let old = segment.get_mut(key).and_then(|e| e.value.take());

        if old.is_some() {
            let mut stats = self.stats.write();
            stats.removes += 1;
            stats.total_keys = stats.total_keys.saturating_sub(1);
            stats.tombstones += 1;
        }
        old
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        let mut segment = self.segments[self.segment_for(key)].write();

        match segment.get_mut(key) {
            Some(entry) if !entry.is_tombstone() => entry.value.clone(),
            Some(entry) => {
                entry.value = Some(value);
                let mut stats = self.stats.write();
                stats.puts += 1;
                stats.total_keys += 1;
                stats.tombstones = stats.tombstones.saturating_sub(1);
                None
            }
            None => {
                segment.insert(key.to_string(), StoredEntry::live(value));
                let mut stats = self.stats.write();
                stats.puts += 1;
                stats.total_keys += 1;
                None
            }
        }
    }

    fn replace(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        let mut segment = self.segments[self.segment_for(key)].write();

        match segment.get_mut(key) {
            Some(entry) if !entry.is_tombstone() => {
                let old = entry.value.replace(value);
                self.stats.write().puts += 1;
                old
            }
            _ => None,
        }
    }

    fn replace_if_equal(&self, key: &str, expected: &[u8], value: Vec<u8>) -> bool {
        let mut segment = self.segments[self.segment_for(key)].write();

        match segment.get_mut(key) {
            Some(entry) if entry.value.as_deref() == Some(expected) => {
                entry.value = Some(value);
                self.stats.write().puts += 1;
                true
            }
            _ => false,
        }
    }

    fn remove_if_equal(&self, key: &str, expected: &[u8]) -> bool {
        let mut segment = self.segments[self.segment_for(key)].write();

        match segment.get_mut(key) {
            Some(entry) if entry.value.as_deref() == Some(expected) => {
                entry.value = None;
                let mut stats = self.stats.write();
                stats.removes += 1;
                stats.total_keys = stats.total_keys.saturating_sub(1);
                stats.tombstones += 1;
                true
            }
            _ => false,
        }
    }

    fn segments(&self) -> usize {
        self.config.segments
    }

    fn entries_for(
        &self,
        segment: usize,
        f: &mut dyn FnMut(&str, &[u8]) -> std::result::Result<(), InvalidSubscriber>,
    ) -> std::result::Result<(), InvalidSubscriber> {
        let segment = self.segments[segment].read();
        for (key, entry) in segment.iter() {
            if let Some(value) = &entry.value {
                f(key, value)?;
            }
        }
        Ok(())
    }

    fn keys_for(
        &self,
        segment: usize,
        f: &mut dyn FnMut(&str) -> std::result::Result<(), InvalidSubscriber>,
    ) -> std::result::Result<(), InvalidSubscriber> {
        let segment = self.segments[segment].read();
        for (key, entry) in segment.iter() {
            if !entry.is_tombstone() {
                f(key)?;
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.stats.read().total_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DirtyBits;

    fn store() -> SegmentedStore {
        SegmentedStore::new(StoreConfig::default()).unwrap()
    }

    #[test]
    fn test_put_get() {
        let s = store();
        assert!(!s.put("k1", b"v1".to_vec()));
        assert_eq!(s.get("k1"), Some(b"v1".to_vec()));
        assert!(s.put("k1", b"v2".to_vec()));
        assert_eq!(s.get("k1"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let s = store();
        s.put("k1", b"v1".to_vec());
        assert!(s.remove("k1"));
        assert!(!s.remove("k1"));
        assert_eq!(s.get("k1"), None);
        // Metadata survives the removal
        assert!(s.replication_data("k1").is_some());
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn test_get_and_put() {
        let s = store();
        assert_eq!(s.get_and_put("k", b"a".to_vec()), None);
        assert_eq!(s.get_and_put("k", b"b".to_vec()), Some(b"a".to_vec()));
    }

    #[test]
    fn test_put_if_absent() {
        let s = store();
        assert_eq!(s.put_if_absent("k", b"a".to_vec()), None);
        assert_eq!(s.put_if_absent("k", b"b".to_vec()), Some(b"a".to_vec()));
        assert_eq!(s.get("k"), Some(b"a".to_vec()));

        // A tombstone does not block insertion
        s.remove("k");
        assert_eq!(s.put_if_absent("k", b"c".to_vec()), None);
        assert_eq!(s.get("k"), Some(b"c".to_vec()));
    }

    #[test]
    fn test_replace_variants() {
        let s = store();
        assert_eq!(s.replace("k", b"a".to_vec()), None);
        s.put("k", b"a".to_vec());
        assert_eq!(s.replace("k", b"b".to_vec()), Some(b"a".to_vec()));

        assert!(!s.replace_if_equal("k", b"a", b"c".to_vec()));
        assert!(s.replace_if_equal("k", b"b", b"c".to_vec()));

        assert!(!s.remove_if_equal("k", b"b"));
        assert!(s.remove_if_equal("k", b"c"));
        assert_eq!(s.get("k"), None);
    }

    #[test]
    fn test_compare_and_set_replication_data() {
        let s = store();
        s.put("k", b"v".to_vec());

        let current = s.replication_data("k");
        let mut next = current.unwrap_or_default();
        next.timestamp = 42;
        next.origin = 7;
        assert!(s.compare_and_set_replication_data("k", current, next));
        assert_eq!(s.replication_data("k").unwrap().timestamp, 42);

        // Stale snapshot must fail
        assert!(!s.compare_and_set_replication_data("k", current, next));
    }

    #[test]
    fn test_dirty_snapshot_and_raise() {
        let s = store();
        s.put("a", b"1".to_vec());
        s.put("b", b"2".to_vec());

        let mut meta = ReplicationData {
            timestamp: 100,
            origin: 1,
            deleted: false,
            dirty: DirtyBits::none(),
        };
        meta.dirty.set(3);
        let snap = s.replication_data("a");
        assert!(s.compare_and_set_replication_data("a", snap, meta));

        let dirty: usize = (0..s.segments()).map(|i| s.dirty_snapshot(i, 3).len()).sum();
        assert_eq!(dirty, 1);
        assert!(s.has_dirty(3));
        assert!(!s.has_dirty(4));

        // Re-raise everything at or after ts 0 for peer 4
        let raised: usize = (0..s.segments()).map(|i| s.raise_dirty_since(i, 4, 0)).sum();
        assert_eq!(raised, 2);
        assert!(s.has_dirty(4));
    }

    #[test]
    fn test_entries_for_abort() {
        let s = store();
        for i in 0..10 {
            s.put(&format!("k{i}"), vec![i]);
        }

        let mut seen = 0;
        for segment in 0..s.segments() {
            let result = s.entries_for(segment, &mut |_, _| {
                seen += 1;
                if seen >= 3 { Err(InvalidSubscriber) } else { Ok(()) }
            });
            if result.is_err() {
                break;
            }
        }
        // The rejection aborts iteration at the third delivery
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_zero_segments_rejected() {
        assert!(SegmentedStore::new(StoreConfig { segments: 0 }).is_err());
    }
}
