//! Wire formats: client handshake frames and bus notifications.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bus header selecting every connection of one person.
pub const PERSON_ID_HEADER: &str = "person_id";

/// Bus header selecting every connection of one owning group.
pub const OWNER_HEADER: &str = "owner";

/// Error text sent when the first frame is not a token payload.
pub const MALFORMED_TOKEN_MESSAGE: &str = "Malformed message: a token had been expected";

// ============================================================================
// Client → Server
// ============================================================================

/// First frame a client sends: the bearer credential.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenAuth {
    #[serde(default)]
    pub token: String,
}

// ============================================================================
// Server → Client
// ============================================================================

/// Error frame sent before closing a rejected connection.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrame {
    pub error: String,
}

impl ErrorFrame {
    pub fn malformed_token() -> Self {
        Self {
            error: MALFORMED_TOKEN_MESSAGE.to_string(),
        }
    }

    pub fn authorization(reason: impl std::fmt::Display) -> Self {
        Self {
            error: format!("Authorization Error: {}", reason),
        }
    }

    /// Serialize to JSON text; quotes in the message come out escaped.
    pub fn to_json(&self) -> String {
        serde_json::json!({ "error": self.error }).to_string()
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Notification payload published on the bus for the front-end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    /// Sender token.
    #[serde(rename = "from", default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Receiver token; when set the notification is delivered to that connection only.
    #[serde(rename = "to", default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
}

impl Notification {
    /// Receiver token, if present and non-empty.
    pub fn receiver(&self) -> Option<&str> {
        self.receiver.as_deref().filter(|r| !r.is_empty())
    }
}

/// A message received from the bus: opaque payload plus string headers.
#[derive(Debug, Clone, Default)]
pub struct BusMessage {
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

impl BusMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}
