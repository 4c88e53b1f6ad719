//! Error types for bridge operations.

use thiserror::Error;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Error types for bridge operations
///
/// The taxonomy separates failures by blast radius: event-level failures
/// (`Validation`) never affect the channel, sink-level failures
/// (`SinkTransient`/`SinkPermanent`) never affect other sinks, and session
/// failures (`Auth`, reconnect exhaustion surfaced as `Transient`) are
/// escalated to the supervisor.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Authentication or authorization rejected by the upstream
    ///
    /// Fatal for a connector; reported to the supervisor and not retried.
    #[error("Authentication failure: {message}")]
    Auth {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transient network failure
    ///
    /// Examples: connection loss, request timeout, upstream 5xx responses.
    /// Drives the reconnect/backoff schedule.
    #[error("Transient network failure: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Event failed extraction or schema validation
    ///
    /// Never retried and never delivered, but still counts toward cursor
    /// advancement so a poison event cannot stall its channel.
    #[error("Validation failure on {channel} at {position}: {message}")]
    Validation {
        channel: String,
        position: String,
        message: String,
    },

    /// A sink publish failed but may succeed if retried
    #[error("Transient sink failure on {sink}: {message}")]
    SinkTransient { sink: String, message: String },

    /// A sink rejected the publish permanently
    #[error("Permanent sink failure on {sink}: {message}")]
    SinkPermanent { sink: String, message: String },

    /// Configuration error - detected at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if this error is a fatal authentication failure
    pub fn is_auth(&self) -> bool {
        matches!(self, BridgeError::Auth { .. })
    }

    /// Check if this error is a transient network failure
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Transient { .. })
    }

    /// Check if this error is an event-level validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, BridgeError::Validation { .. })
    }

    /// Create an auth failure from a message
    pub fn auth(message: impl Into<String>) -> Self {
        BridgeError::Auth {
            message: message.into(),
            source: None,
        }
    }

    /// Create an auth failure with source
    pub fn auth_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        BridgeError::Auth {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transient failure from a message
    pub fn transient(message: impl Into<String>) -> Self {
        BridgeError::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient failure with source
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        BridgeError::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation failure for an event
    pub fn validation(
        channel: impl Into<String>,
        position: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        BridgeError::Validation {
            channel: channel.into(),
            position: position.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Configuration(message.into())
    }
}

// Conversion from serde_json::Error
impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}
