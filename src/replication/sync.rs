use super::config::ReplicationConfig;
use super::coordinator::ReplicationCoordinator;
use super::iterator::ModificationIterator;
use super::types::{ReplicationError, ReplicationResult};
use crate::core::current_time_millis;
use crate::protocol::{ReplicationChannel, WireCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Initiating side of the bootstrap protocol: declare ourselves and the
/// newest change we hold from the expected peer (0 when the peer is
/// unknown, forcing a full resend), and learn the remote identifier from
/// the reply.
pub fn initiate_handshake(
    coordinator: &ReplicationCoordinator,
    channel: &dyn ReplicationChannel,
    known_peer: Option<u8>,
) -> ReplicationResult<u8> {
    let last_updated_time = known_peer
        .map(|peer| coordinator.last_modification_time(peer))
        .unwrap_or(0);

    let reply = channel.request(WireCommand::Handshake {
        identifier: coordinator.identifier(),
        last_updated_time,
    })?;

    match reply {
        WireCommand::HandshakeReply { identifier } => {
            info!("Handshake complete, remote identifier={}", identifier);
            Ok(identifier)
        }
        other => Err(ReplicationError::UnexpectedCommand(format!("{other:?}"))),
    }
}

/// Accepting side: acquire the peer's iterator, re-dirty everything it may
/// be missing since its declared timestamp, and produce the reply frame.
pub fn accept_handshake(
    coordinator: &ReplicationCoordinator,
    identifier: u8,
    last_updated_time: i64,
) -> ReplicationResult<(WireCommand, Arc<ModificationIterator>)> {
    let iterator = coordinator.acquire_modification_iterator(identifier)?;
    let raised = iterator.dirty_entries(last_updated_time);
    debug!(
        "Accepted handshake from peer {}, {} entries to resend since {}",
        identifier, raised, last_updated_time
    );
    Ok((
        WireCommand::HandshakeReply {
            identifier: coordinator.identifier(),
        },
        iterator,
    ))
}

/// One drain pass: stream every dirty entry for this peer, then the
/// explicit batch terminator. Returns how many entries were found.
pub fn drain_once(
    iterator: &ModificationIterator,
    channel: &dyn ReplicationChannel,
) -> ReplicationResult<usize> {
    let mut newest = 0i64;
    let found = iterator.for_each(&mut |entry| {
        newest = newest.max(entry.timestamp);
        channel.send(WireCommand::Entry(entry))
    })?;

    let data_up_to = if newest != 0 { newest } else { current_time_millis() };
    channel.send(WireCommand::BatchComplete { data_up_to })?;
    Ok(found)
}

/// Apply one received frame on the accepting coordinator.
///
/// Entries go through conflict resolution; the batch terminator surfaces as
/// a `BatchCompletion` event to local subscribers. Handshake frames are the
/// connection layer's business and are rejected here.
pub fn apply_command(
    coordinator: &ReplicationCoordinator,
    cmd: WireCommand,
) -> ReplicationResult<bool> {
    match cmd {
        WireCommand::Entry(entry) => {
            let applied = coordinator.apply_replication(&entry);
            // Even a rejected entry advances the received high-water mark
            coordinator.set_last_modification_time(entry.origin, entry.timestamp);
            Ok(applied)
        }
        WireCommand::BatchComplete { data_up_to } => {
            coordinator.notify_batch_complete(data_up_to);
            Ok(true)
        }
        other => Err(ReplicationError::UnexpectedCommand(format!("{other:?}"))),
    }
}

/// Spawn the long-running drain task for one peer: drain, then sleep until
/// the next wake (or the fallback interval), until shutdown.
pub fn spawn_drain_task(
    iterator: Arc<ModificationIterator>,
    channel: Arc<dyn ReplicationChannel>,
    config: &ReplicationConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let drain_interval = Duration::from_millis(config.drain_interval_ms);
    tokio::spawn(async move {
        info!("Drain task started for peer {}", iterator.peer());
        loop {
            if let Err(e) = drain_once(&iterator, channel.as_ref()) {
                warn!("Drain for peer {} failed: {}", iterator.peer(), e);
                break;
            }

            if *shutdown.borrow() {
                break;
            }
            if iterator.has_next() {
                // A batch-limited pass left entries behind; drain again
                // before sleeping
                continue;
            }

            tokio::select! {
                _ = iterator.wait_for_changes() => {}
                _ = tokio::time::sleep(drain_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }
        info!("Drain task stopped for peer {}", iterator.peer());
    })
}
