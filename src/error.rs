//! Error types shared across the daemon.

use thiserror::Error;

/// Top-level error for daemon operations.
///
/// Configuration problems abort startup; everything else is logged,
/// counted and retried by the owning component.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("invalid address format: {0}")]
    InvalidAddressFormat(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("{field} out of range: {reason}")]
    OutOfRange { field: String, reason: String },

    #[error("peer {0} unreachable: {1}")]
    PeerUnreachable(String, String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("platform agent error: {0}")]
    PlatformAgent(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("memory limit exceeded: rss {rss_mb} MB > limit {limit_mb} MB")]
    MemoryLimitExceeded { rss_mb: u64, limit_mb: u64 },

    #[error("internal invariant violation: {0}")]
    InvariantViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for configuration rule violations.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for numeric bound violations.
    pub fn out_of_range(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::OutOfRange {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_field() {
        let err = Error::invalid_config("spark_config.hello_time_s", "must be positive");
        let msg = err.to_string();
        assert!(msg.contains("invalid configuration"));
        assert!(msg.contains("spark_config.hello_time_s"));
    }

    #[test]
    fn test_out_of_range_names_field() {
        let err = Error::out_of_range("neighbor_discovery_port", "must be in 1..=65535");
        assert!(err.to_string().contains("neighbor_discovery_port"));
    }
}
