//! Error types for the caching engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the caching engine
///
/// The type is `Clone` because a single backing-store load is shared by every
/// caller waiting on the same key, and each of them receives the same error.
#[derive(Error, Debug, Clone, PartialEq)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Backing store has no value for the key
    #[error("Key not found in backing store: {key}")]
    NotFound { key: String },

    /// Backing store call exceeded its timeout
    #[error("Backing store {operation} timed out for key {key} after {timeout:?}")]
    BackingStoreTimeout {
        operation: &'static str,
        key: String,
        timeout: Duration,
    },

    /// Any other backing store failure
    #[error("Backing store error: {0}")]
    BackingStore(String),

    /// TTL was zero or otherwise unusable
    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    /// Capacity (or shard layout) cannot hold entries
    #[error("Capacity misconfigured: {0}")]
    CapacityMisconfigured(String),

    /// A write-behind entry failed every retry
    #[error("Write-behind flush exhausted for key {key} after {attempts} attempts: {reason}")]
    FlushExhausted {
        key: String,
        attempts: u32,
        reason: String,
    },

    // =========================================================================
    // Boundary Errors
    // =========================================================================
    /// Payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cache has been shut down
    #[error("Cache has been shut down")]
    ShutDown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the "backing store has nothing" signal, which callers treat as a miss
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for failures caused by the backing store (timeouts included)
    pub fn is_backing_store(&self) -> bool {
        matches!(
            self,
            Error::BackingStore(_) | Error::BackingStoreTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::BackingStoreTimeout {
            operation: "load",
            key: "user:1".into(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "Backing store load timed out for key user:1 after 250ms"
        );

        let err = Error::FlushExhausted {
            key: "user:2".into(),
            attempts: 3,
            reason: "connection reset".into(),
        };
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::NotFound { key: "k".into() }.is_not_found());
        assert!(Error::BackingStore("boom".into()).is_backing_store());
        assert!(!Error::InvalidTtl("zero".into()).is_backing_store());
    }

    #[test]
    fn test_codec_error_from_serde() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Codec(_)));
    }
}
