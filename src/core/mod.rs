pub mod error;
pub mod store;
pub mod types;

pub use error::{InvalidSubscriber, MeshError, Result};
pub use store::{KeyValueStore, SegmentedStore};
pub use types::{
    DIRTY_BIT_LANES, DirtyBits, MAX_IDENTIFIER, ReplicationData, StoreConfig, StoreStats,
    StoredEntry, current_time_millis,
};
