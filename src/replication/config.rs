use crate::core::MAX_IDENTIFIER;
use serde::{Deserialize, Serialize};

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// This node's replication identifier (0..=127)
    pub local_identifier: u8,

    /// Fallback poll interval for drain tasks in milliseconds; wakes are
    /// edge-triggered, the poll only bounds staleness after missed wakes
    pub drain_interval_ms: u64,

    /// Entries delivered per drain pass before yielding; leftovers keep
    /// their dirty bits and go out on the next pass
    pub drain_batch_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            local_identifier: 0,
            drain_interval_ms: 1000,
            drain_batch_size: 1024,
        }
    }
}

impl ReplicationConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.local_identifier > MAX_IDENTIFIER {
            return Err(format!(
                "local_identifier must be <= {}, got {}",
                MAX_IDENTIFIER, self.local_identifier
            ));
        }
        if self.drain_batch_size == 0 {
            return Err("drain_batch_size must be nonzero".to_string());
        }
        Ok(())
    }
}
