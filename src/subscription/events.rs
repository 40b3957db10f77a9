use crate::core::InvalidSubscriber;

/// One change to a subscribable store.
///
/// Immutable value object; fan-out hands the same event to every consumer.
/// `BatchCompletion` is the explicit end-of-sync sentinel emitted after a
/// replication drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEvent {
    Inserted {
        key: String,
        value: Vec<u8>,
    },
    Updated {
        key: String,
        /// Populated only when some consumer needs it (see
        /// `SubscriptionCollection::needs_previous`)
        old_value: Option<Vec<u8>>,
        new_value: Vec<u8>,
    },
    Removed {
        key: String,
        old_value: Option<Vec<u8>>,
    },
    BatchCompletion {
        /// All data up to this timestamp has been delivered
        data_up_to: i64,
    },
}

impl MapEvent {
    /// Key this event is about, if any
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Inserted { key, .. } | Self::Updated { key, .. } | Self::Removed { key, .. } => {
                Some(key)
            }
            Self::BatchCompletion { .. } => None,
        }
    }

    /// Value after the change: the new value for inserts/updates, `None`
    /// for removals and batch markers.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Inserted { value, .. } => Some(value),
            Self::Updated { new_value, .. } => Some(new_value),
            Self::Removed { .. } | Self::BatchCompletion { .. } => None,
        }
    }

    /// Dispatch this event to the matching listener method
    pub fn apply(&self, listener: &mut dyn EventListener) -> Result<(), InvalidSubscriber> {
        match self {
            Self::Inserted { key, value } => listener.on_inserted(key, value),
            Self::Updated {
                key,
                old_value,
                new_value,
            } => listener.on_updated(key, old_value.as_deref(), new_value),
            Self::Removed { key, old_value } => listener.on_removed(key, old_value.as_deref()),
            Self::BatchCompletion { data_up_to } => listener.on_batch_completion(*data_up_to),
        }
    }
}

/// Per-kind listener interface for [`MapEvent::apply`] dispatch
pub trait EventListener {
    fn on_inserted(&mut self, key: &str, value: &[u8]) -> Result<(), InvalidSubscriber>;

    fn on_updated(
        &mut self,
        key: &str,
        old_value: Option<&[u8]>,
        new_value: &[u8],
    ) -> Result<(), InvalidSubscriber>;

    fn on_removed(&mut self, key: &str, old_value: Option<&[u8]>) -> Result<(), InvalidSubscriber>;

    fn on_batch_completion(&mut self, _data_up_to: i64) -> Result<(), InvalidSubscriber> {
        Ok(())
    }
}

/// Entry-level subscriber: receives full events
pub trait EntrySubscriber: Send + Sync {
    fn on_event(&self, event: &MapEvent) -> Result<(), InvalidSubscriber>;

    /// Called exactly once when the subscription ends; errors are logged and
    /// swallowed by the collection.
    fn on_end_of_subscription(&self) -> Result<(), InvalidSubscriber> {
        Ok(())
    }
}

/// Key-only subscriber: receives just the changed key
pub trait KeySubscriber: Send + Sync {
    fn on_key(&self, key: &str) -> Result<(), InvalidSubscriber>;

    fn on_end_of_subscription(&self) -> Result<(), InvalidSubscriber> {
        Ok(())
    }
}

/// Topic subscriber: receives `(key, value)` pairs, `None` for removals
pub trait TopicSubscriber: Send + Sync {
    fn on_message(&self, key: &str, value: Option<&[u8]>) -> Result<(), InvalidSubscriber>;

    fn on_end_of_subscription(&self) -> Result<(), InvalidSubscriber> {
        Ok(())
    }
}

/// Downstream consumer of a collection's full event stream, used to chain
/// collections (e.g. a decompression adapter in front of a compressed
/// backing collection).
pub trait EventConsumer: Send + Sync {
    fn consume(&self, event: &MapEvent);
}

/// Options for a new subscription
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionContext {
    /// Replay the store's current contents to the new subscriber before
    /// live delivery
    pub bootstrap: bool,
    /// Snapshot-query mode: end the subscription right after bootstrap
    pub end_subscription_after_bootstrap: bool,
}

impl Default for SubscriptionContext {
    fn default() -> Self {
        Self {
            bootstrap: true,
            end_subscription_after_bootstrap: false,
        }
    }
}

impl SubscriptionContext {
    /// Live-only subscription, no initial replay
    pub fn live_only() -> Self {
        Self {
            bootstrap: false,
            end_subscription_after_bootstrap: false,
        }
    }

    /// One-shot snapshot: bootstrap, then end the subscription
    pub fn snapshot() -> Self {
        Self {
            bootstrap: true,
            end_subscription_after_bootstrap: true,
        }
    }
}
