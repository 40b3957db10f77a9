use super::config::ReplicationConfig;
use super::iterator::ModificationIterator;
use super::types::{
    RemoteNodeState, ReplicationEntry, ReplicationError, ReplicationResult, ReplicationStats,
};
use crate::core::{
    DirtyBits, KeyValueStore, MAX_IDENTIFIER, ReplicationData, SegmentedStore,
};
use crate::subscription::{ChangeSink, MapEvent, SubscriptionCollection};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// Single authority per store for identifier assignment, conflict-resolved
/// apply, and modification-iterator lifecycle.
///
/// Local mutations reach it through the subscription collection's change
/// hook; remote entries through [`apply_replication`](Self::apply_replication).
/// Per-entry metadata is committed with optimistic replace-if-equal retries
/// instead of held locks.
pub struct ReplicationCoordinator {
    identifier: u8,
    drain_batch_size: usize,
    store: Arc<SegmentedStore>,
    iterators: RwLock<HashMap<u8, Arc<ModificationIterator>>>,
    states: RwLock<HashMap<u8, Arc<RemoteNodeState>>>,
    subscriptions: RwLock<Option<Arc<SubscriptionCollection>>>,
    applied: AtomicU64,
    rejected: AtomicU64,
}

impl ReplicationCoordinator {
    pub fn new(config: &ReplicationConfig, store: Arc<SegmentedStore>) -> ReplicationResult<Self> {
        config.validate().map_err(ReplicationError::InvalidConfig)?;

        info!(
            "Initializing replication coordinator, identifier={}",
            config.local_identifier
        );

        Ok(Self {
            identifier: config.local_identifier,
            drain_batch_size: config.drain_batch_size,
            store,
            iterators: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(None),
            applied: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// This node's own byte identifier
    pub fn identifier(&self) -> u8 {
        self.identifier
    }

    /// Wire this coordinator and a subscription collection together: local
    /// events feed the dirty-bit store, applied remote entries fan out to
    /// subscribers (without re-entering replication).
    pub fn bind(self: &Arc<Self>, subscriptions: &Arc<SubscriptionCollection>) {
        subscriptions.set_replicator(Arc::clone(self) as Arc<dyn ChangeSink>);
        *self.subscriptions.write() = Some(Arc::clone(subscriptions));
    }

    fn state_for(&self, peer: u8) -> Arc<RemoteNodeState> {
        if let Some(state) = self.states.read().get(&peer) {
            return Arc::clone(state);
        }
        Arc::clone(
            self.states
                .write()
                .entry(peer)
                .or_insert_with(|| Arc::new(RemoteNodeState::default())),
        )
    }

    /// Idempotently acquire the modification iterator for one remote peer.
    ///
    /// The first acquisition zeroes that peer's bootstrap state, marking it
    /// as requiring a fresh bootstrap timestamp.
    pub fn acquire_modification_iterator(
        &self,
        peer: u8,
    ) -> ReplicationResult<Arc<ModificationIterator>> {
        if peer > MAX_IDENTIFIER || peer == self.identifier {
            return Err(ReplicationError::InvalidIdentifier(peer));
        }

        if let Some(iterator) = self.iterators.read().get(&peer) {
            return Ok(Arc::clone(iterator));
        }

        let state = self.state_for(peer);
        let mut iterators = self.iterators.write();
        let iterator = iterators.entry(peer).or_insert_with(|| {
            info!("Acquiring modification iterator for peer {}", peer);
            state.reset();
            Arc::new(ModificationIterator::new(
                peer,
                Arc::clone(&self.store),
                state.clone(),
                self.drain_batch_size,
            ))
        });
        Ok(Arc::clone(iterator))
    }

    /// Deterministic last-writer-wins check: a strictly newer timestamp
    /// wins; equal timestamps are won by the lower-or-equal origin
    /// identifier so every replica converges on the same value.
    pub fn should_apply_remote_modification(
        local: &ReplicationData,
        entry: &ReplicationEntry,
    ) -> bool {
        entry.timestamp > local.timestamp
            || (entry.timestamp == local.timestamp && entry.origin <= local.origin)
    }

    /// Apply one remotely-replicated entry with conflict resolution.
    ///
    /// Returns whether the entry won. An overwrite of an existing record
    /// drops all pending dirty bits: a remote-sourced change must not
    /// re-propagate as if it were fresh.
    pub fn apply_replication(&self, entry: &ReplicationEntry) -> bool {
        loop {
            let current = self.store.replication_data(&entry.key);
            if let Some(local) = &current {
                if !Self::should_apply_remote_modification(local, entry) {
                    trace!(
                        "Rejected {} (remote ts={} origin={}, local ts={} origin={})",
                        entry.key, entry.timestamp, entry.origin, local.timestamp, local.origin
                    );
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }

            let was_live = current.is_some_and(|c| !c.deleted);
            let subscriptions = self.subscriptions.read().clone();
            let old_value = match &subscriptions {
                Some(subs) if was_live && subs.needs_previous() => self.store.get(&entry.key),
                _ => None,
            };

            let meta = ReplicationData {
                timestamp: entry.timestamp,
                origin: entry.origin,
                deleted: entry.deleted,
                dirty: DirtyBits::none(),
            };

            if !self
                .store
                .apply_replicated_if(&entry.key, current, entry.value.clone(), meta)
            {
                // Lost the race against a concurrent commit; re-run the
                // whole read-compute-apply cycle
                continue;
            }

            self.applied.fetch_add(1, Ordering::Relaxed);
            self.state_for(entry.origin)
                .set_last_modification_time(entry.timestamp);
            debug!(
                "Applied {} from origin {} (ts={}, deleted={})",
                entry.key, entry.origin, entry.timestamp, entry.deleted
            );

            if let Some(subs) = subscriptions {
                let event = if entry.deleted {
                    if !was_live {
                        return true;
                    }
                    MapEvent::Removed {
                        key: entry.key.clone(),
                        old_value,
                    }
                } else if was_live {
                    MapEvent::Updated {
                        key: entry.key.clone(),
                        old_value,
                        new_value: entry.value.clone().unwrap_or_default(),
                    }
                } else {
                    MapEvent::Inserted {
                        key: entry.key.clone(),
                        value: entry.value.clone().unwrap_or_default(),
                    }
                };
                subs.notify_replicated(&event);
            }
            return true;
        }
    }

    /// Monotonic per-peer high-water mark of applied changes
    pub fn last_modification_time(&self, peer: u8) -> i64 {
        self.state_for(peer).last_modification_time()
    }

    pub fn set_last_modification_time(&self, peer: u8, t: i64) {
        self.state_for(peer).set_last_modification_time(t);
    }

    /// Timestamp a reconnecting peer should pass to `dirty_entries`
    pub fn bootstrap_timestamp(&self, peer: u8) -> i64 {
        self.state_for(peer).bootstrap_timestamp()
    }

    /// Surface a remote batch terminator to local subscribers
    pub fn notify_batch_complete(&self, data_up_to: i64) {
        if let Some(subs) = self.subscriptions.read().clone() {
            subs.notify_replicated(&MapEvent::BatchCompletion { data_up_to });
        }
    }

    pub fn stats(&self) -> ReplicationStats {
        let iterators = self.iterators.read();
        ReplicationStats {
            entries_sent: iterators.values().map(|i| i.entries_sent()).sum(),
            entries_applied: self.applied.load(Ordering::Relaxed),
            entries_rejected: self.rejected.load(Ordering::Relaxed),
            known_peers: iterators.len(),
        }
    }
}

/// Local mutations enter the dirty-bit store through this hook
impl ChangeSink for ReplicationCoordinator {
    /// Stamp a local change: bump the entry's timestamp monotonically, mark
    /// our own origin, raise every acquired peer's dirty bit, then
    /// invalidate bootstrap freshness and wake all iterators.
    fn on_change(&self, key: &str, deleted: bool, timestamp: i64) {
        loop {
            let current = self.store.replication_data(key);
            let base = current.unwrap_or_default();

            // A node's own writes are always strictly increasing
            let effective = timestamp.max(base.timestamp + 1);
            let mut next = ReplicationData {
                timestamp: effective,
                origin: self.identifier,
                deleted,
                dirty: base.dirty,
            };
            {
                let iterators = self.iterators.read();
                for peer in iterators.keys() {
                    next.dirty.set(*peer);
                }
            }

            if self.store.compare_and_set_replication_data(key, current, next) {
                break;
            }
        }

        let iterators = self.iterators.read();
        for (peer, iterator) in iterators.iter() {
            self.state_for(*peer).invalidate_bootstrap_timestamp();
            iterator.wake();
        }
    }
}
