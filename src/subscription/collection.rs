use super::events::{
    EntrySubscriber, EventConsumer, KeySubscriber, MapEvent, SubscriptionContext, TopicSubscriber,
};
use crate::core::{InvalidSubscriber, KeyValueStore, current_time_millis};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identifier for a registered subscriber
pub type SubscriberId = String;

/// Replication-side hook invoked for every authoritative local mutation.
///
/// Implemented by the replication coordinator; the collection calls it for
/// locally-originated events only, never for changes that arrived via
/// replication (suppressing re-replication storms).
pub trait ChangeSink: Send + Sync {
    fn on_change(&self, key: &str, deleted: bool, timestamp: i64);
}

/// Statistics for one subscription collection
#[derive(Debug, Default, Clone, Serialize)]
pub struct SubscriptionStats {
    pub entry_subscribers: usize,
    pub key_subscribers: usize,
    pub topic_subscribers: usize,
    pub downstream_consumers: usize,
    pub events_delivered: u64,
    pub bootstrap_events: u64,
    pub subscribers_evicted: u64,
}

/// Fan-out hub for one logical store.
///
/// Holds entry, key and topic subscribers plus downstream consumers and
/// child collections; membership uses copy-on-write snapshots so delivery
/// never blocks, nor is blocked by, registration.
pub struct SubscriptionCollection {
    name: String,
    store: RwLock<Option<Arc<dyn KeyValueStore>>>,
    entry_subscribers: RwLock<Vec<(SubscriberId, Arc<dyn EntrySubscriber>)>>,
    key_subscribers: RwLock<Vec<(SubscriberId, Arc<dyn KeySubscriber>)>>,
    topic_subscribers: RwLock<Vec<(SubscriberId, Arc<dyn TopicSubscriber>)>>,
    downstream: RwLock<Vec<Arc<dyn EventConsumer>>>,
    children: RwLock<HashMap<String, Arc<SubscriptionCollection>>>,
    replicator: RwLock<Option<Arc<dyn ChangeSink>>>,
    stats: RwLock<SubscriptionStats>,
}

impl SubscriptionCollection {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!("Creating subscription collection: {}", name);
        Self {
            name,
            store: RwLock::new(None),
            entry_subscribers: RwLock::new(Vec::new()),
            key_subscribers: RwLock::new(Vec::new()),
            topic_subscribers: RwLock::new(Vec::new()),
            downstream: RwLock::new(Vec::new()),
            children: RwLock::new(HashMap::new()),
            replicator: RwLock::new(None),
            stats: RwLock::new(SubscriptionStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the underlying store; required for bootstrap replay
    pub fn attach_store(&self, store: Arc<dyn KeyValueStore>) {
        *self.store.write() = Some(store);
    }

    /// Attach the replication hook for locally-originated changes
    pub fn set_replicator(&self, sink: Arc<dyn ChangeSink>) {
        *self.replicator.write() = Some(sink);
    }

    /// Chain a downstream consumer that receives every event unchanged
    pub fn add_downstream(&self, consumer: Arc<dyn EventConsumer>) {
        self.downstream.write().push(consumer);
    }

    /// Register a child collection under a key of the hierarchical
    /// namespace; events for that key forward their value to the child.
    pub fn add_child(&self, key: impl Into<String>, child: Arc<SubscriptionCollection>) {
        self.children.write().insert(key.into(), child);
    }

    /// Register an entry-level subscriber.
    ///
    /// The subscriber joins the live set before any bootstrap replay, so an
    /// update racing the registration is seen by at least one of the two
    /// paths; duplicates are tolerated by contract.
    pub fn register_entry_subscriber(
        &self,
        context: SubscriptionContext,
        subscriber: Arc<dyn EntrySubscriber>,
    ) -> SubscriberId {
        let id = Uuid::new_v4().to_string();
        self.entry_subscribers
            .write()
            .push((id.clone(), Arc::clone(&subscriber)));
        debug!("Entry subscriber {} registered on {}", id, self.name);

        if context.bootstrap {
            let survived = self.bootstrap_entries(&id, |key, value| {
                subscriber.on_event(&MapEvent::Inserted {
                    key: key.to_string(),
                    value: value.to_vec(),
                })
            });
            if !survived {
                return id;
            }
        }

        if context.end_subscription_after_bootstrap {
            self.unregister_subscriber(&id);
        }
        id
    }

    /// Register a key-only subscriber
    pub fn register_key_subscriber(
        &self,
        context: SubscriptionContext,
        subscriber: Arc<dyn KeySubscriber>,
    ) -> SubscriberId {
        let id = Uuid::new_v4().to_string();
        self.key_subscribers
            .write()
            .push((id.clone(), Arc::clone(&subscriber)));
        debug!("Key subscriber {} registered on {}", id, self.name);

        if context.bootstrap {
            let store = self.store.read().clone();
            if let Some(store) = store {
                let mut failed = false;
                for segment in 0..store.segments() {
                    let result = store.keys_for(segment, &mut |key| {
                        self.stats.write().bootstrap_events += 1;
                        subscriber.on_key(key)
                    });
                    if result.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    self.evict(&id);
                    return id;
                }
            }
        }

        if context.end_subscription_after_bootstrap {
            self.unregister_subscriber(&id);
        }
        id
    }

    /// Register a topic subscriber; bootstrap replays `(key, value)` pairs
    pub fn register_topic_subscriber(
        &self,
        context: SubscriptionContext,
        subscriber: Arc<dyn TopicSubscriber>,
    ) -> SubscriberId {
        let id = Uuid::new_v4().to_string();
        self.topic_subscribers
            .write()
            .push((id.clone(), Arc::clone(&subscriber)));
        debug!("Topic subscriber {} registered on {}", id, self.name);

        if context.bootstrap {
            let survived = self.bootstrap_entries(&id, |key, value| {
                subscriber.on_message(key, Some(value))
            });
            if !survived {
                return id;
            }
        }

        if context.end_subscription_after_bootstrap {
            self.unregister_subscriber(&id);
        }
        id
    }

    /// Replay the store's current entries to one new subscriber; returns
    /// false when the subscriber rejected delivery and was evicted.
    fn bootstrap_entries(
        &self,
        id: &str,
        mut deliver: impl FnMut(&str, &[u8]) -> Result<(), InvalidSubscriber>,
    ) -> bool {
        let store = self.store.read().clone();
        let Some(store) = store else {
            return true;
        };

        for segment in 0..store.segments() {
            let result = store.entries_for(segment, &mut |key, value| {
                self.stats.write().bootstrap_events += 1;
                deliver(key, value)
            });
            if result.is_err() {
                // A subscriber that failed before even catching up is not
                // worth retaining
                warn!("Subscriber {} rejected bootstrap on {}, evicting", id, self.name);
                self.evict(id);
                return false;
            }
        }
        true
    }

    /// Unregister a subscriber of any kind.
    ///
    /// Invokes `on_end_of_subscription` exactly once; an error from the
    /// callback is logged, never propagated.
    pub fn unregister_subscriber(&self, id: &str) -> bool {
        if let Some(sub) = remove_by_id(&self.entry_subscribers, id) {
            self.finish(id, sub.on_end_of_subscription());
            return true;
        }
        if let Some(sub) = remove_by_id(&self.key_subscribers, id) {
            self.finish(id, sub.on_end_of_subscription());
            return true;
        }
        self.unregister_topic_subscriber(id)
    }

    /// Unregister a topic subscriber
    pub fn unregister_topic_subscriber(&self, id: &str) -> bool {
        if let Some(sub) = remove_by_id(&self.topic_subscribers, id) {
            self.finish(id, sub.on_end_of_subscription());
            return true;
        }
        false
    }

    fn finish(&self, id: &str, result: Result<(), InvalidSubscriber>) {
        if let Err(e) = result {
            // Subscriber misbehavior must not break teardown of others
            warn!("on_end_of_subscription failed for {}: {}", id, e);
        }
        debug!("Subscriber {} unregistered from {}", id, self.name);
    }

    /// Drop a subscriber without the end-of-subscription callback (it asked
    /// to stop by rejecting delivery).
    fn evict(&self, id: &str) {
        let removed = remove_by_id(&self.entry_subscribers, id).is_some()
            || remove_by_id(&self.key_subscribers, id).is_some()
            || remove_by_id(&self.topic_subscribers, id).is_some();
        if removed {
            self.stats.write().subscribers_evicted += 1;
        }
    }

    /// True iff some consumer needs the old value of updates; store facades
    /// use this to decide whether a plain put must fetch the previous value.
    pub fn needs_previous(&self) -> bool {
        !self.entry_subscribers.read().is_empty() || !self.downstream.read().is_empty()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.entry_subscribers.read().is_empty()
            || !self.key_subscribers.read().is_empty()
            || !self.topic_subscribers.read().is_empty()
    }

    /// Authoritative entry point for locally-originated events: informs the
    /// replication hook, then fans out to subscribers.
    pub fn notify_event(&self, event: &MapEvent) {
        let replicator = self.replicator.read().clone();
        if let Some(sink) = replicator {
            match event {
                MapEvent::Inserted { key, .. } | MapEvent::Updated { key, .. } => {
                    sink.on_change(key, false, current_time_millis());
                }
                MapEvent::Removed { key, .. } => {
                    sink.on_change(key, true, current_time_millis());
                }
                MapEvent::BatchCompletion { .. } => {}
            }
        }
        self.notify_subscribers(event);
    }

    /// Fan-out without the replication hook, used for changes that arrived
    /// via replication.
    pub fn notify_replicated(&self, event: &MapEvent) {
        self.notify_subscribers(event);
    }

    fn notify_subscribers(&self, event: &MapEvent) {
        // Cheap fast path: nothing to deliver to
        if !self.has_subscribers()
            && self.downstream.read().is_empty()
            && self.children.read().is_empty()
        {
            return;
        }

        let mut delivered = 0u64;

        if let Some(key) = event.key() {
            let topic_subs = self.topic_subscribers.read().clone();
            let mut failed: Vec<SubscriberId> = Vec::new();
            for (id, sub) in &topic_subs {
                match sub.on_message(key, event.value()) {
                    Ok(()) => delivered += 1,
                    Err(_) => failed.push(id.clone()),
                }
            }

            let key_subs = self.key_subscribers.read().clone();
            for (id, sub) in &key_subs {
                match sub.on_key(key) {
                    Ok(()) => delivered += 1,
                    Err(_) => failed.push(id.clone()),
                }
            }

            for id in &failed {
                warn!("Subscriber {} rejected delivery on {}, evicting", id, self.name);
                self.evict(id);
            }
        }

        let entry_subs = self.entry_subscribers.read().clone();
        let mut failed: Vec<SubscriberId> = Vec::new();
        for (id, sub) in &entry_subs {
            match sub.on_event(event) {
                Ok(()) => delivered += 1,
                Err(_) => failed.push(id.clone()),
            }
        }
        for id in &failed {
            warn!("Subscriber {} rejected delivery on {}, evicting", id, self.name);
            self.evict(id);
        }

        let downstream = self.downstream.read().clone();
        for consumer in &downstream {
            consumer.consume(event);
        }

        // Hierarchical namespace: a change to a key naming a child asset is
        // forwarded to that child's own subscription.
        if let Some(key) = event.key() {
            let child = self.children.read().get(key).cloned();
            if let Some(child) = child {
                child.notify_child_value(key, event.value());
            }
        }

        self.stats.write().events_delivered += delivered;
    }

    /// Deliver a parent-scoped value change to this collection's topic
    /// subscribers (the child side of hierarchical propagation).
    fn notify_child_value(&self, key: &str, value: Option<&[u8]>) {
        let topic_subs = self.topic_subscribers.read().clone();
        let mut failed: Vec<SubscriberId> = Vec::new();
        for (id, sub) in &topic_subs {
            if sub.on_message(key, value).is_err() {
                failed.push(id.clone());
            }
        }
        for id in &failed {
            self.evict(id);
        }
    }

    pub fn stats(&self) -> SubscriptionStats {
        let mut stats = self.stats.read().clone();
        stats.entry_subscribers = self.entry_subscribers.read().len();
        stats.key_subscribers = self.key_subscribers.read().len();
        stats.topic_subscribers = self.topic_subscribers.read().len();
        stats.downstream_consumers = self.downstream.read().len();
        stats
    }
}

/// A collection can itself sit downstream of another collection
impl EventConsumer for SubscriptionCollection {
    fn consume(&self, event: &MapEvent) {
        self.notify_event(event);
    }
}

fn remove_by_id<S: ?Sized>(
    set: &RwLock<Vec<(SubscriberId, Arc<S>)>>,
    id: &str,
) -> Option<Arc<S>> {
    let mut set = set.write();
    let index = set.iter().position(|(sid, _)| sid == id)?;
    Some(set.remove(index).1)
}
