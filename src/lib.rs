pub mod core;
pub mod protocol;
pub mod replication;
pub mod subscription;

// Re-export commonly used types
pub use crate::core::{
    DirtyBits, KeyValueStore, MAX_IDENTIFIER, MeshError, ReplicationData, SegmentedStore,
    StoreConfig, StoreStats, StoredEntry,
};
pub use protocol::{ReplicationChannel, WireCommand};
pub use replication::{
    ModificationIterator, ReplicationConfig, ReplicationCoordinator, ReplicationEntry,
    ReplicationError, ReplicationStats,
};
pub use subscription::{
    CompressedDownstream, EntrySubscriber, EventConsumer, KeySubscriber, MapEvent,
    SubscribableStore, SubscriptionCollection, SubscriptionContext, TopicSubscriber,
};
