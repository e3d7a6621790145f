//! Error types

use thiserror::Error;

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Subscription filter errors, raised while parsing a client's request target
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("Missing required parameter: exchange")]
    MissingExchange,

    #[error("At least one of book / trades is required")]
    MissingChannel,

    #[error("Malformed parameter: {0}")]
    MalformedParameter(String),
}

/// Exchange feed errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Feed disconnected")]
    Disconnected,

    #[error("Rate limited")]
    RateLimited,

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Timeout waiting for data")]
    Timeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Unknown symbol on {exchange}: {symbol}")]
    UnknownSymbol { exchange: String, symbol: String },

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),
}

impl FeedError {
    /// Fatal errors end the connector instance and are escalated to the
    /// worker; everything else is retried with backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FeedError::AuthenticationFailed(_)
                | FeedError::UnknownSymbol { .. }
                | FeedError::UnknownExchange(_)
        )
    }
}

/// Shard worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Connector failed: {0}")]
    Connector(#[from] FeedError),

    #[error("Failed to build worker runtime: {0}")]
    Runtime(String),

    #[error("Connector task panicked: {0}")]
    Panicked(String),
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
pub type FilterResult<T> = Result<T, FilterError>;
pub type FeedResult<T> = Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(FeedError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(FeedError::UnknownExchange("ftx".into()).is_fatal());
        assert!(FeedError::UnknownSymbol {
            exchange: "kraken".into(),
            symbol: "FOO-BAR".into(),
        }
        .is_fatal());

        assert!(!FeedError::Disconnected.is_fatal());
        assert!(!FeedError::RateLimited.is_fatal());
        assert!(!FeedError::InvalidMessage("garbage".into()).is_fatal());
    }
}
