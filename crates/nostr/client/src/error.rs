//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Frame could not be sent because the relay is idle, closing or closed
    #[error("Not connected to relay")]
    NotConnected,

    /// Inbound frame that is not valid NIP-01
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// No OK frame for a published event within the publish timeout
    #[error("Publish timed out after {0:?}")]
    PublishTimeout(std::time::Duration),

    /// Event failed structure, id or signature verification
    #[error("Verification failure: {0}")]
    VerificationFailure(String),

    /// Pool, or the relay serving the request, was shut down
    #[error("Relay pool closed")]
    PoolClosed,

    /// Invalid relay URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Transport failure (connect, send or read)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection attempt did not complete in time
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// Outbound serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::InvalidUrl(err.to_string())
    }
}

impl From<crate::message::MessageError> for ClientError {
    fn from(err: crate::message::MessageError) -> Self {
        ClientError::ProtocolDecode(err.to_string())
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
