//! Error types for FluxStats

use thiserror::Error;

/// Result type alias for FluxStats operations
pub type Result<T> = std::result::Result<T, StatsError>;

/// FluxStats error types
///
/// Errors fall into three classes: transient (retried with backoff),
/// data (the offending event goes to the bad-event sink) and fatal
/// (surfaced to the caller, never retried).
#[derive(Error, Debug)]
pub enum StatsError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An identifier that must have been issued has no reverse mapping
    #[error("Dictionary corruption: no name mapped to uid {0}")]
    DictionaryCorruption(String),

    /// The identifier sequence no longer fits the configured width
    #[error("UID namespace exhausted: next id {next} exceeds max {max} for width {width}")]
    NamespaceExhausted { next: u64, max: u64, width: usize },

    /// Conditional create lost a race or the store rejected the write
    #[error("UID conflict for name {0}")]
    UidConflict(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Raw event could not be turned into aggregates
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Event names a statistic with no configuration
    #[error("Unknown statistic: {0}")]
    UnknownStatistic(String),

    /// Attempt to merge a count aggregate with a value aggregate
    #[error("Cannot merge {left} aggregate with {right} aggregate")]
    AggregateMismatch {
        left: &'static str,
        right: &'static str,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable aggregate store error
    #[error("Store error: {0}")]
    Store(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation abandoned because of shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StatsError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatsError::Io(_) | StatsError::UidConflict(_) | StatsError::Store(_)
        )
    }

    /// Check if error is fatal and must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StatsError::DictionaryCorruption(_)
                | StatsError::NamespaceExhausted { .. }
                | StatsError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is caused by the content of an event
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            StatsError::InvalidEvent(_)
                | StatsError::UnknownStatistic(_)
                | StatsError::AggregateMismatch { .. }
                | StatsError::InvalidFormat(_)
        )
    }
}
