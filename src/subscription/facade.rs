use super::collection::SubscriptionCollection;
use super::events::MapEvent;
use crate::core::KeyValueStore;
use ahash::RandomState;
use parking_lot::Mutex;
use std::hash::BuildHasher;
use std::sync::Arc;
use tracing::debug;

const NOTIFY_STRIPES: usize = 64;

/// Mutation-to-event bridge: wraps a raw store so every external mutation
/// produces exactly one event on the subscription collection.
///
/// The facade always chooses the cheapest operation that still yields an
/// exact event: a plain `put` only pays for an old-value fetch when some
/// consumer actually needs it. Mutation and event delivery for one key
/// happen under the same stripe lock, so a subscriber sees the events for
/// a given key in the order the mutations were applied.
#[derive(Clone)]
pub struct SubscribableStore {
    store: Arc<dyn KeyValueStore>,
    subscriptions: Arc<SubscriptionCollection>,
    notify_locks: Arc<Vec<Mutex<()>>>,
    hasher: RandomState,
}

impl SubscribableStore {
    pub fn new(store: Arc<dyn KeyValueStore>, subscriptions: Arc<SubscriptionCollection>) -> Self {
        subscriptions.attach_store(Arc::clone(&store));
        Self {
            store,
            subscriptions,
            notify_locks: Arc::new((0..NOTIFY_STRIPES).map(|_| Mutex::new(())).collect()),
            hasher: RandomState::new(),
        }
    }

    fn order_lock(&self, key: &str) -> &Mutex<()> {
        &self.notify_locks[self.hasher.hash_one(key) as usize % NOTIFY_STRIPES]
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionCollection> {
        &self.subscriptions
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.get(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Insert or overwrite; returns whether a previous value existed.
    ///
    /// When a consumer needs old values, upgrades to the fetch-old-value
    /// path; otherwise the event type is inferred from the store's
    /// had-previous flag alone.
    pub fn put(&self, key: &str, value: Vec<u8>) -> bool {
        let _order = self.order_lock(key).lock();
        if self.subscriptions.needs_previous() {
            return self.get_and_put_locked(key, value).is_some();
        }

        let had_previous = self.store.put(key, value.clone());
        let event = if had_previous {
            MapEvent::Updated {
                key: key.to_string(),
                old_value: None,
                new_value: value,
            }
        } else {
            MapEvent::Inserted {
                key: key.to_string(),
                value,
            }
        };
        self.subscriptions.notify_event(&event);
        had_previous
    }

    /// Insert or overwrite, returning and reporting the old value
    pub fn get_and_put(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        let _order = self.order_lock(key).lock();
        self.get_and_put_locked(key, value)
    }

    fn get_and_put_locked(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        let old = self.store.get_and_put(key, value.clone());
        let event = match &old {
            Some(old_value) => MapEvent::Updated {
                key: key.to_string(),
                old_value: Some(old_value.clone()),
                new_value: value,
            },
            None => MapEvent::Inserted {
                key: key.to_string(),
                value,
            },
        };
        self.subscriptions.notify_event(&event);
        old
    }

    /// Remove; returns whether a value was removed
    pub fn remove(&self, key: &str) -> bool {
        let _order = self.order_lock(key).lock();
        if self.subscriptions.needs_previous() {
            return self.get_and_remove_locked(key).is_some();
        }

        let removed = self.store.remove(key);
        if removed {
            self.subscriptions.notify_event(&MapEvent::Removed {
                key: key.to_string(),
                old_value: None,
            });
        } else {
            debug!("Remove of absent key {}, no event", key);
        }
        removed
    }

    /// Remove, returning and reporting the old value
    pub fn get_and_remove(&self, key: &str) -> Option<Vec<u8>> {
        let _order = self.order_lock(key).lock();
        self.get_and_remove_locked(key)
    }

    fn get_and_remove_locked(&self, key: &str) -> Option<Vec<u8>> {
        let old = self.store.get_and_remove(key);
        if let Some(old_value) = &old {
            self.subscriptions.notify_event(&MapEvent::Removed {
                key: key.to_string(),
                old_value: Some(old_value.clone()),
            });
        }
        old
    }

    /// Insert only when absent; returns the existing value otherwise
    pub fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        let _order = self.order_lock(key).lock();
        let existing = self.store.put_if_absent(key, value.clone());
        if existing.is_none() {
            self.subscriptions.notify_event(&MapEvent::Inserted {
                key: key.to_string(),
                value,
            });
        }
        existing
    }

    /// Overwrite only when present; returns the old value
    pub fn replace(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        let _order = self.order_lock(key).lock();
        let old = self.store.replace(key, value.clone());
        if let Some(old_value) = &old {
            self.subscriptions.notify_event(&MapEvent::Updated {
                key: key.to_string(),
                old_value: Some(old_value.clone()),
                new_value: value,
            });
        }
        old
    }

    /// Overwrite only when the current value equals `expected`
    pub fn replace_if_equal(&self, key: &str, expected: &[u8], value: Vec<u8>) -> bool {
        let _order = self.order_lock(key).lock();
        let replaced = self.store.replace_if_equal(key, expected, value.clone());
        if replaced {
            self.subscriptions.notify_event(&MapEvent::Updated {
                key: key.to_string(),
                old_value: Some(expected.to_vec()),
                new_value: value,
            });
        }
        replaced
    }

    /// Remove only when the current value equals `expected`
    pub fn remove_if_equal(&self, key: &str, expected: &[u8]) -> bool {
        let _order = self.order_lock(key).lock();
        let removed = self.store.remove_if_equal(key, expected);
        if removed {
            self.subscriptions.notify_event(&MapEvent::Removed {
                key: key.to_string(),
                old_value: Some(expected.to_vec()),
            });
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InvalidSubscriber, SegmentedStore, StoreConfig};
    use crate::subscription::events::{EntrySubscriber, SubscriptionContext};
    use parking_lot::Mutex;

    struct Recording {
        events: Mutex<Vec<MapEvent>>,
    }

    impl EntrySubscriber for Recording {
        fn on_event(&self, event: &MapEvent) -> Result<(), InvalidSubscriber> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    /// Store stub that panics on any fetch-old-value path
    struct NoReadStore {
        inner: SegmentedStore,
    }

    impl KeyValueStore for NoReadStore {
        fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: Vec<u8>) -> bool {
            self.inner.put(key, value)
        }
        fn get_and_put(&self, _: &str, _: Vec<u8>) -> Option<Vec<u8>> {
            panic!("fetch-old-value path must not run without entry subscribers");
        }
        fn remove(&self, key: &str) -> bool {
            self.inner.remove(key)
        }
        fn get_and_remove(&self, _: &str) -> Option<Vec<u8>> {
            panic!("fetch-old-value path must not run without entry subscribers");
        }
        fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
            self.inner.put_if_absent(key, value)
        }
        fn replace(&self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
            self.inner.replace(key, value)
        }
        fn replace_if_equal(&self, key: &str, expected: &[u8], value: Vec<u8>) -> bool {
            self.inner.replace_if_equal(key, expected, value)
        }
        fn remove_if_equal(&self, key: &str, expected: &[u8]) -> bool {
            self.inner.remove_if_equal(key, expected)
        }
        fn segments(&self) -> usize {
            self.inner.segments()
        }
        fn entries_for(
            &self,
            segment: usize,
            f: &mut dyn FnMut(&str, &[u8]) -> Result<(), InvalidSubscriber>,
        ) -> Result<(), InvalidSubscriber> {
            self.inner.entries_for(segment, f)
        }
        fn keys_for(
            &self,
            segment: usize,
            f: &mut dyn FnMut(&str) -> Result<(), InvalidSubscriber>,
        ) -> Result<(), InvalidSubscriber> {
            self.inner.keys_for(segment, f)
        }
        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    fn facade() -> SubscribableStore {
        let store = Arc::new(SegmentedStore::new(StoreConfig::default()).unwrap());
        SubscribableStore::new(store, Arc::new(SubscriptionCollection::new("facade")))
    }

    #[test]
    fn test_put_without_observers_skips_old_value_fetch() {
        let store = Arc::new(NoReadStore {
            inner: SegmentedStore::new(StoreConfig::default()).unwrap(),
        });
        let facade =
            SubscribableStore::new(store, Arc::new(SubscriptionCollection::new("stub")));

        assert!(!facade.put("k", b"a".to_vec()));
        assert!(facade.put("k", b"b".to_vec()));
        assert!(facade.remove("k"));
    }

    #[test]
    fn test_put_with_entry_subscriber_reports_old_value() {
        let facade = facade();
        let sub = Arc::new(Recording { events: Mutex::new(Vec::new()) });
        facade
            .subscriptions()
            .register_entry_subscriber(SubscriptionContext::live_only(), sub.clone());

        facade.put("k", b"a".to_vec());
        facade.put("k", b"b".to_vec());

        let events = sub.events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], MapEvent::Inserted { key, value } if key == "k" && value == b"a"));
        assert!(matches!(
            &events[1],
            MapEvent::Updated { key, old_value: Some(old), new_value }
                if key == "k" && old == b"a" && new_value == b"b"
        ));
    }

    #[test]
    fn test_exact_events_for_conditional_ops() {
        let facade = facade();
        let sub = Arc::new(Recording { events: Mutex::new(Vec::new()) });
        facade
            .subscriptions()
            .register_entry_subscriber(SubscriptionContext::live_only(), sub.clone());

        assert_eq!(facade.put_if_absent("k", b"a".to_vec()), None);
        assert_eq!(facade.put_if_absent("k", b"x".to_vec()), Some(b"a".to_vec()));
        assert!(facade.replace_if_equal("k", b"a", b"b".to_vec()));
        assert!(!facade.replace_if_equal("k", b"a", b"z".to_vec()));
        assert_eq!(facade.replace("k", b"c".to_vec()), Some(b"b".to_vec()));
        assert!(facade.remove_if_equal("k", b"c"));

        let events = sub.events.lock();
        // One event per successful mutation, none for the failed ones
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], MapEvent::Inserted { .. }));
        assert!(matches!(
            &events[1],
            MapEvent::Updated { old_value: Some(old), .. } if old == b"a"
        ));
        assert!(matches!(
            &events[2],
            MapEvent::Updated { old_value: Some(old), .. } if old == b"b"
        ));
        assert!(matches!(
            &events[3],
            MapEvent::Removed { old_value: Some(old), .. } if old == b"c"
        ));
    }

    #[test]
    fn test_per_key_event_order_under_contention() {
        let facade = facade();
        let sub = Arc::new(Recording { events: Mutex::new(Vec::new()) });
        facade
            .subscriptions()
            .register_entry_subscriber(SubscriptionContext::live_only(), sub.clone());

        let writers: Vec<_> = (0..2)
            .map(|t| {
                let facade = facade.clone();
                std::thread::spawn(move || {
                    for i in 0..50u8 {
                        facade.put("k", vec![t, i]);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        // Delivery order must match apply order: one insert, then an
        // unbroken old-value chain through every update
        let events = sub.events.lock();
        assert_eq!(events.len(), 100);
        assert!(matches!(&events[0], MapEvent::Inserted { .. }));

        let mut previous = events[0].value().map(<[u8]>::to_vec);
        for event in events.iter().skip(1) {
            match event {
                MapEvent::Updated {
                    old_value,
                    new_value,
                    ..
                } => {
                    assert_eq!(old_value.as_deref(), previous.as_deref());
                    previous = Some(new_value.clone());
                }
                other => panic!("expected update, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_remove_of_absent_key_emits_nothing() {
        let facade = facade();
        let sub = Arc::new(Recording { events: Mutex::new(Vec::new()) });
        facade
            .subscriptions()
            .register_entry_subscriber(SubscriptionContext::live_only(), sub.clone());

        assert!(!facade.remove("ghost"));
        assert_eq!(facade.get_and_remove("ghost"), None);
        assert!(sub.events.lock().is_empty());
    }
}
