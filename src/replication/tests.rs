//! Two-node replication scenarios exercising the full path: local change,
//! dirty-bit drain, wire frames, conflict-resolved apply, fan-out.

use super::sync;
use super::{ReplicationConfig, ReplicationCoordinator};
use super::types::{ReplicationError, ReplicationResult};
use crate::core::{KeyValueStore, SegmentedStore, StoreConfig};
use crate::protocol::{ReplicationChannel, WireCommand};
use crate::subscription::{
    ChangeSink, EntrySubscriber, MapEvent, SubscriptionCollection, SubscriptionContext,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Node {
    id: u8,
    store: Arc<SegmentedStore>,
    coordinator: Arc<ReplicationCoordinator>,
}

impl Node {
    fn new(id: u8) -> Self {
        init_tracing();
        let store = Arc::new(SegmentedStore::new(StoreConfig::default()).unwrap());
        let config = ReplicationConfig {
            local_identifier: id,
            ..Default::default()
        };
        let coordinator = Arc::new(ReplicationCoordinator::new(&config, Arc::clone(&store)).unwrap());
        Self { id, store, coordinator }
    }

    fn write(&self, key: &str, value: &[u8], timestamp: i64) {
        self.store.put(key, value.to_vec());
        self.coordinator.on_change(key, false, timestamp);
    }

    fn delete(&self, key: &str, timestamp: i64) {
        self.store.remove(key);
        self.coordinator.on_change(key, true, timestamp);
    }
}

/// Channel that applies every frame straight into the remote coordinator
struct DirectChannel {
    target: Arc<ReplicationCoordinator>,
}

impl ReplicationChannel for DirectChannel {
    fn send(&self, cmd: WireCommand) -> ReplicationResult<()> {
        sync::apply_command(&self.target, cmd).map(|_| ())
    }

    fn request(&self, cmd: WireCommand) -> ReplicationResult<WireCommand> {
        match cmd {
            WireCommand::Handshake { identifier, last_updated_time } => {
                let (reply, _) = sync::accept_handshake(&self.target, identifier, last_updated_time)?;
                Ok(reply)
            }
            other => Err(ReplicationError::UnexpectedCommand(format!("{other:?}"))),
        }
    }
}

fn drain(from: &Node, to: &Node) -> usize {
    let iter = from.coordinator.acquire_modification_iterator(to.id).unwrap();
    let channel = DirectChannel { target: Arc::clone(&to.coordinator) };
    sync::drain_once(&iter, &channel).unwrap()
}

fn sync_until_quiet(a: &Node, b: &Node) {
    // Applied remote entries carry no dirty bits, so this terminates
    while drain(a, b) + drain(b, a) > 0 {}
}

#[test]
fn test_concurrent_writes_converge() {
    let a = Node::new(1);
    let b = Node::new(2);
    a.coordinator.acquire_modification_iterator(2).unwrap();
    b.coordinator.acquire_modification_iterator(1).unwrap();

    // Both nodes write every key concurrently, with colliding timestamps
    // on some keys (i = 0 and i = 13 produce exact ties)
    let mut ops_a = Vec::new();
    let mut ops_b = Vec::new();
    for i in 0..20i64 {
        let key = format!("key-{i}");
        ops_a.push((key.clone(), format!("a{i}").into_bytes(), 1_000 + (i * 7) % 13));
        ops_b.push((key, format!("b{i}").into_bytes(), 1_000 + (i * 5) % 13));
    }

    let mut rng = StdRng::seed_from_u64(42);
    ops_a.shuffle(&mut rng);
    ops_b.shuffle(&mut rng);
    for (key, value, ts) in &ops_a {
        a.write(key, value, *ts);
    }
    for (key, value, ts) in &ops_b {
        b.write(key, value, *ts);
    }

    sync_until_quiet(&a, &b);

    for i in 0..20i64 {
        let key = format!("key-{i}");
        let ts_a = 1_000 + (i * 7) % 13;
        let ts_b = 1_000 + (i * 5) % 13;
        // Newest timestamp wins; on a tie the lower origin identifier wins
        let expected = if ts_a >= ts_b {
            format!("a{i}").into_bytes()
        } else {
            format!("b{i}").into_bytes()
        };

        assert_eq!(a.store.get(&key), Some(expected.clone()), "node A diverged on {key}");
        assert_eq!(b.store.get(&key), Some(expected), "node B diverged on {key}");

        let meta_a = a.store.replication_data(&key).unwrap();
        let meta_b = b.store.replication_data(&key).unwrap();
        assert_eq!(meta_a.timestamp, meta_b.timestamp);
        assert_eq!(meta_a.origin, meta_b.origin);
    }
}

#[test]
fn test_handshake_bootstraps_new_peer() {
    let a = Node::new(1);
    let b = Node::new(2);

    // Data written before the peer ever connected
    a.write("x", b"1", 1_000);
    a.write("y", b"2", 2_000);

    let channel_to_a = DirectChannel { target: Arc::clone(&a.coordinator) };
    let remote = sync::initiate_handshake(&b.coordinator, &channel_to_a, None).unwrap();
    assert_eq!(remote, 1);

    // Accepting the handshake re-dirtied everything since time 0
    assert_eq!(drain(&a, &b), 2);
    assert_eq!(b.store.get("x"), Some(b"1".to_vec()));
    assert_eq!(b.store.get("y"), Some(b"2".to_vec()));
    assert_eq!(b.coordinator.last_modification_time(1), 2_000);
}

#[test]
fn test_reconnect_resends_only_newer_entries() {
    let a = Node::new(1);
    let b = Node::new(2);

    a.write("old", b"1", 1_000);
    a.write("new", b"2", 2_000);

    let channel_to_a = DirectChannel { target: Arc::clone(&a.coordinator) };
    sync::initiate_handshake(&b.coordinator, &channel_to_a, None).unwrap();
    drain(&a, &b);
    assert_eq!(b.coordinator.last_modification_time(1), 2_000);

    // A write whose delivery is lost: drain into the void
    a.write("missed", b"3", 3_000);
    let iter = a.coordinator.acquire_modification_iterator(2).unwrap();
    iter.for_each(&mut |_| Ok(())).unwrap();
    assert_eq!(b.store.get("missed"), None);

    // Reconnect declaring "I have everything up to 2000"
    sync::initiate_handshake(&b.coordinator, &channel_to_a, Some(1)).unwrap();
    let resent = drain(&a, &b);
    assert!(resent >= 1);
    assert_eq!(b.store.get("missed"), Some(b"3".to_vec()));
    // "old" predates the declared timestamp and was not resent
    assert!(resent <= 2);
}

#[test]
fn test_delete_propagates_as_tombstone() {
    let a = Node::new(1);
    let b = Node::new(2);
    a.coordinator.acquire_modification_iterator(2).unwrap();

    a.write("k", b"v", 1_000);
    drain(&a, &b);
    assert_eq!(b.store.get("k"), Some(b"v".to_vec()));

    a.delete("k", 2_000);
    drain(&a, &b);
    assert_eq!(b.store.get("k"), None);

    // The tombstone keeps the stamp so a stale resurrect loses
    let meta = b.store.replication_data("k").unwrap();
    assert!(meta.deleted);
    assert_eq!(meta.timestamp, 2_000);
}

#[test]
fn test_batch_complete_surfaces_to_subscribers() {
    struct Recording {
        events: Mutex<Vec<MapEvent>>,
    }
    impl EntrySubscriber for Recording {
        fn on_event(&self, event: &MapEvent) -> Result<(), crate::core::InvalidSubscriber> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    let a = Node::new(1);
    let b = Node::new(2);
    a.coordinator.acquire_modification_iterator(2).unwrap();

    let subs = Arc::new(SubscriptionCollection::new("replica"));
    b.coordinator.bind(&subs);
    let sub = Arc::new(Recording { events: Mutex::new(Vec::new()) });
    subs.register_entry_subscriber(SubscriptionContext::live_only(), sub.clone());

    a.write("k", b"v", 1_000);
    drain(&a, &b);

    let events = sub.events.lock();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], MapEvent::Inserted { key, .. } if key == "k"));
    assert!(matches!(events[1], MapEvent::BatchCompletion { data_up_to: 1_000 }));
}

#[tokio::test]
async fn test_drain_task_replicates_and_shuts_down() {
    let a = Node::new(1);
    let b = Node::new(2);
    let iter = a.coordinator.acquire_modification_iterator(2).unwrap();
    let channel: Arc<dyn ReplicationChannel> =
        Arc::new(DirectChannel { target: Arc::clone(&b.coordinator) });

    let config = ReplicationConfig {
        local_identifier: 1,
        drain_interval_ms: 20,
        ..Default::default()
    };
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = sync::spawn_drain_task(Arc::clone(&iter), channel, &config, shutdown_rx);

    a.write("k", b"v", 1_000);
    for _ in 0..100 {
        if b.store.get("k").is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(b.store.get("k"), Some(b"v".to_vec()));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
