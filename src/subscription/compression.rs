use super::collection::SubscriptionCollection;
use super::events::{EventConsumer, MapEvent};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

/// Downstream adapter that forwards events with lz4-compressed values to a
/// backing collection, layering a compressed representation under a plain
/// one.
///
/// Values smaller than `min_payload_size` pass through uncompressed.
pub struct CompressedDownstream {
    backing: Arc<SubscriptionCollection>,
    min_payload_size: usize,
}

impl CompressedDownstream {
    pub fn new(backing: Arc<SubscriptionCollection>) -> Self {
        Self {
            backing,
            min_payload_size: 64,
        }
    }

    pub fn with_min_payload_size(mut self, min_payload_size: usize) -> Self {
        self.min_payload_size = min_payload_size;
        self
    }

    fn maybe_compress(&self, data: &[u8]) -> Vec<u8> {
        if data.len() < self.min_payload_size {
            return data.to_vec();
        }
        match compress(data) {
            Ok(compressed) => {
                debug!("Compressed {} to {} bytes", data.len(), compressed.len());
                compressed
            }
            Err(e) => {
                warn!("Compression failed, forwarding raw: {}", e);
                data.to_vec()
            }
        }
    }
}

impl EventConsumer for CompressedDownstream {
    fn consume(&self, event: &MapEvent) {
        let forwarded = match event {
            MapEvent::Inserted { key, value } => MapEvent::Inserted {
                key: key.clone(),
                value: self.maybe_compress(value),
            },
            MapEvent::Updated {
                key,
                old_value,
                new_value,
            } => MapEvent::Updated {
                key: key.clone(),
                old_value: old_value.as_deref().map(|v| self.maybe_compress(v)),
                new_value: self.maybe_compress(new_value),
            },
            MapEvent::Removed { .. } | MapEvent::BatchCompletion { .. } => event.clone(),
        };
        self.backing.notify_event(&forwarded);
    }
}

/// lz4-frame compress a buffer
pub fn compress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = lz4::EncoderBuilder::new().level(4).build(Vec::new())?;
    encoder.write_all(data)?;
    let (compressed, result) = encoder.finish();
    result?;
    Ok(compressed)
}

/// Inverse of [`compress`]
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = lz4::Decoder::new(data)?;
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
