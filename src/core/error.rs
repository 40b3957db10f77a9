use thiserror::Error;

/// Main error type for meshkv store operations
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Segment out of range: {0}")]
    SegmentOutOfRange(usize),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Raised by a subscriber callback to reject further delivery.
///
/// Caught at the fan-out call site; the offending subscriber is removed and
/// the error never propagates past the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("subscriber rejected further delivery")]
pub struct InvalidSubscriber;

/// Result type alias for meshkv store operations
pub type Result<T> = std::result::Result<T, MeshError>;
