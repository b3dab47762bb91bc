//! Error types for the gateway.

use crate::protocol::DecodeError;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Topic string violates the level grammar or wildcard placement rules.
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    /// Publish topic cannot be matched (malformed or wildcard-bearing).
    #[error("cannot match topic: {0}")]
    Match(String),

    /// All 65535 topic ids are in use.
    #[error("topic id space exhausted")]
    IdSpaceExhausted,

    /// Upstream broker operation did not complete within the deadline.
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Upstream broker transport failure.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Datagram could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Broker connection could not be established.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
