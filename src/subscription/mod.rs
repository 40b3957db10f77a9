//! Subscription and event fan-out engine.
//!
//! One [`SubscriptionCollection`] per logical store fans a single
//! authoritative stream of change events out to entry, key and topic
//! subscribers, chained downstream consumers, and child collections in a
//! hierarchical namespace. New subscribers can be bootstrapped with the
//! store's current contents before switching to live delivery.

pub mod collection;
pub mod compression;
pub mod events;
pub mod facade;

pub use collection::{ChangeSink, SubscriberId, SubscriptionCollection, SubscriptionStats};
pub use compression::CompressedDownstream;
pub use events::{
    EntrySubscriber, EventConsumer, EventListener, KeySubscriber, MapEvent, SubscriptionContext,
    TopicSubscriber,
};
pub use facade::SubscribableStore;
