//! Connection envelope: one authenticated client's identity and mailbox.
//!
//! The envelope owns the only sending half of the mailbox. Whoever holds the
//! envelope (normally the hub) therefore decides when the mailbox closes:
//! dropping the envelope closes it, and the outbound actor answers a closed
//! mailbox with a close frame.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Unique id of one envelope, distinct from its token.
pub type ConnectionId = Uuid;

/// Receiving half of a connection's mailbox.
pub type Mailbox = mpsc::Receiver<Bytes>;

/// Identity metadata returned by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    /// Person identifier (UUID formatted).
    pub person_id: String,
    /// Owning group identifier.
    pub owner: String,
}

/// Addresses one envelope: the registry key plus the envelope's own id.
///
/// Unregistering by key rather than by token keeps actors of a displaced
/// envelope from removing the envelope that replaced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub token: String,
    pub id: ConnectionId,
}

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Mailbox at capacity; the consumer is too slow.
    Full,
    /// The outbound actor is gone.
    Closed,
}

/// State for a single authenticated client.
#[derive(Debug)]
pub struct Connection {
    key: ConnectionKey,
    identity: Identity,
    mailbox: mpsc::Sender<Bytes>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    /// Create an envelope with a bounded mailbox of `capacity` payloads.
    pub fn new(token: impl Into<String>, identity: Identity, capacity: usize) -> (Self, Mailbox) {
        let (tx, rx) = mpsc::channel(capacity);
        let connection = Self {
            key: ConnectionKey {
                token: token.into(),
                id: Uuid::new_v4(),
            },
            identity,
            mailbox: tx,
            connected_at: Utc::now(),
        };
        (connection, rx)
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.key.token
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Seconds since the envelope was created.
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.connected_at).num_seconds()
    }

    /// Enqueue a payload without waiting.
    pub fn offer(&self, payload: Bytes) -> Offer {
        match self.mailbox.try_send(payload) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => Offer::Full,
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }
}
