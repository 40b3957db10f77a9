use super::types::{RemoteNodeState, ReplicationEntry, ReplicationResult};
use crate::core::{KeyValueStore, SegmentedStore, current_time_millis};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Per-peer cursor over the store's dirty bits.
///
/// Yields every entry whose bit for this peer is raised and clears the bit
/// after successful delivery. Wakes are edge-triggered and may be coalesced;
/// consumers re-scan after each wake instead of assuming a pending count.
pub struct ModificationIterator {
    peer: u8,
    store: Arc<SegmentedStore>,
    state: Arc<RemoteNodeState>,
    batch: usize,
    notify: Notify,
    entries_sent: AtomicU64,
}

impl ModificationIterator {
    pub(crate) fn new(
        peer: u8,
        store: Arc<SegmentedStore>,
        state: Arc<RemoteNodeState>,
        batch: usize,
    ) -> Self {
        Self {
            peer,
            store,
            state,
            batch,
            notify: Notify::new(),
            entries_sent: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> u8 {
        self.peer
    }

    /// Whether any entry currently has this peer's dirty bit raised
    pub fn has_next(&self) -> bool {
        self.store.has_dirty(self.peer)
    }

    /// Drain up to one batch of currently-dirty entries to the consumer.
    ///
    /// The dirty bit is cleared with a replace-if-equal against the snapshot
    /// taken before delivery, so an entry re-dirtied mid-delivery keeps its
    /// bit and is re-delivered on the next pass. Entries beyond the batch
    /// size also keep their bits for the next pass. A pass that finds
    /// nothing proposes a fresh bootstrap timestamp for this peer.
    pub fn for_each(
        &self,
        consumer: &mut dyn FnMut(ReplicationEntry) -> ReplicationResult<()>,
    ) -> ReplicationResult<usize> {
        let bootstrap_timestamp = self.state.bootstrap_timestamp();
        let mut found = 0usize;
        let mut delivered = 0usize;

        'scan: for segment in 0..self.store.segments() {
            for (key, value, meta) in self.store.dirty_snapshot(segment, self.peer) {
                if found == self.batch {
                    break 'scan;
                }
                found += 1;

                consumer(ReplicationEntry {
                    key: key.clone(),
                    value,
                    timestamp: meta.timestamp,
                    origin: meta.origin,
                    deleted: meta.deleted,
                    bootstrap_timestamp,
                })?;
                self.entries_sent.fetch_add(1, Ordering::Relaxed);

                let mut cleared = meta;
                cleared.dirty.clear(self.peer);
                if self
                    .store
                    .compare_and_set_replication_data(&key, Some(meta), cleared)
                {
                    delivered += 1;
                } else {
                    // Re-dirtied (or otherwise restamped) during delivery;
                    // the next pass picks it up again
                    trace!("Entry {} changed during delivery to peer {}", key, self.peer);
                }
            }
        }

        if found == 0 {
            // Nothing to replicate right now: the peer is caught up as of
            // this instant, so a reconnect may resume from here
            self.state.propose_bootstrap_timestamp(current_time_millis());
        }

        debug!(
            "Drain pass for peer {}: {} found, {} cleared",
            self.peer, found, delivered
        );
        Ok(found)
    }

    /// Re-raise this peer's dirty bit on every entry whose timestamp is at
    /// or after `from_timestamp`; used when a reconnecting peer declares
    /// "I have everything up to T". Returns how many entries were marked.
    pub fn dirty_entries(&self, from_timestamp: i64) -> usize {
        let raised: usize = (0..self.store.segments())
            .map(|segment| self.store.raise_dirty_since(segment, self.peer, from_timestamp))
            .sum();
        debug!(
            "Re-dirtied {} entries for peer {} since {}",
            raised, self.peer, from_timestamp
        );
        raised
    }

    /// Await the next wake; wakes are permits, so one arriving just before
    /// the call is not lost.
    pub async fn wait_for_changes(&self) {
        self.notify.notified().await;
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn entries_sent(&self) -> u64 {
        self.entries_sent.load(Ordering::Relaxed)
    }
}
