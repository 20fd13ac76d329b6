//! Gateway error types.

use crate::identity::IdentityError;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No frame arrived within the read window.
    #[error("Read deadline exceeded")]
    ReadTimeout,

    /// A write did not complete within the write deadline.
    #[error("Write deadline exceeded")]
    WriteTimeout,

    /// The peer sent a frame above the size limit.
    #[error("Frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),

    /// The first frame was not a token payload.
    #[error("Malformed credential frame: {0}")]
    MalformedCredential(String),

    /// The identity service rejected the credential.
    #[error("Authorization error: {0}")]
    Identity(#[from] IdentityError),

    /// Client not found.
    #[error("Client is not registered: {0}")]
    ClientNotFound(String),

    /// `person_id` header is not a UUID.
    #[error("Malformed person ID in message header: {0}")]
    MalformedPersonId(String),

    /// Neither a receiver nor a routing header.
    #[error("No person_id or owner in the header of the received message")]
    MissingRoutingKey,

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GatewayError::ChannelSend
    }
}

impl GatewayError {
    /// Short label used for the `reason` metric dimension.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::Json(_) => "malformed_payload",
            GatewayError::ClientNotFound(_) => "unresolved_receiver",
            GatewayError::MalformedPersonId(_) => "malformed_person_id",
            GatewayError::MissingRoutingKey => "missing_routing_key",
            _ => "other",
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_labels() {
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(GatewayError::from(json).reason(), "malformed_payload");
        assert_eq!(
            GatewayError::ClientNotFound("tok".into()).reason(),
            "unresolved_receiver"
        );
        assert_eq!(
            GatewayError::MalformedPersonId("x".into()).reason(),
            "malformed_person_id"
        );
        assert_eq!(GatewayError::MissingRoutingKey.reason(), "missing_routing_key");
        assert_eq!(GatewayError::WriteTimeout.reason(), "other");
    }
}
