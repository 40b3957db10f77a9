//! Wire frames exchanged between replication peers.
//!
//! The transport itself is an external collaborator; this module only fixes
//! the command vocabulary and a bincode length-prefix codec for transports
//! that want one.

use crate::replication::types::{ReplicationEntry, ReplicationError, ReplicationResult};
use serde::{Deserialize, Serialize};

/// Commands exchanged over a replication channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireCommand {
    /// Initiating side declares itself and the newest remote change it has
    Handshake { identifier: u8, last_updated_time: i64 },

    /// Accepting side replies with its own replication identifier
    HandshakeReply { identifier: u8 },

    /// One replicated change
    Entry(ReplicationEntry),

    /// Explicit end-of-sync marker after a drain pass
    BatchComplete { data_up_to: i64 },
}

/// An opaque bidirectional channel to one remote peer.
///
/// `send` is fire-and-forget; `request` is a correlated request/response
/// exchange. Persistent event streams are modelled by the caller invoking
/// `send` per frame and the remote feeding received frames to
/// [`apply_command`](crate::replication::sync::apply_command).
pub trait ReplicationChannel: Send + Sync {
    fn send(&self, cmd: WireCommand) -> ReplicationResult<()>;

    fn request(&self, cmd: WireCommand) -> ReplicationResult<WireCommand>;
}

/// Encode a command with a u32 big-endian length prefix
pub fn encode_frame(cmd: &WireCommand) -> ReplicationResult<Vec<u8>> {
    let data = bincode::serialize(cmd)?;
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

/// Decode one length-prefixed command; returns the command and the number
/// of bytes consumed, or `None` when the buffer holds an incomplete frame.
pub fn decode_frame(buf: &[u8]) -> ReplicationResult<Option<(WireCommand, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let cmd = bincode::deserialize(&buf[4..4 + len])
        .map_err(|e| ReplicationError::SerializationError(e.to_string()))?;
    Ok(Some((cmd, 4 + len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let cmd = WireCommand::Entry(ReplicationEntry {
            key: "k".to_string(),
            value: Some(b"v".to_vec()),
            timestamp: 123,
            origin: 7,
            deleted: false,
            bootstrap_timestamp: 99,
        });

        let frame = encode_frame(&cmd).unwrap();
        let (decoded, consumed) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_incomplete_frame() {
        let frame = encode_frame(&WireCommand::HandshakeReply { identifier: 3 }).unwrap();
        assert!(decode_frame(&frame[..2]).unwrap().is_none());
        assert!(decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let a = encode_frame(&WireCommand::Handshake {
            identifier: 1,
            last_updated_time: 10,
        })
        .unwrap();
        let b = encode_frame(&WireCommand::BatchComplete { data_up_to: 20 }).unwrap();

        let mut buf = a.clone();
        buf.extend_from_slice(&b);

        let (first, consumed) = decode_frame(&buf).unwrap().unwrap();
        assert!(matches!(first, WireCommand::Handshake { identifier: 1, .. }));
        let (second, _) = decode_frame(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(second, WireCommand::BatchComplete { data_up_to: 20 });
    }
}
