//! Registry of authenticated connections.
//!
//! A single read/write lock guards the token → envelope map. Lookups and
//! fan-out passes share the read lock; register and unregister take the write
//! lock for the map mutation only. Nothing here evicts while holding the read
//! lock: passes report the keys to evict and the caller unregisters them
//! after the pass.

use crate::connection::{Connection, ConnectionKey, Identity, Offer};
use crate::error::{GatewayError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

/// Outcome of a targeted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Mailbox full or closed; the connection must be unregistered.
    Evict(ConnectionKey),
    NotFound,
}

/// Outcome of a fan-out pass.
#[derive(Debug, Default)]
pub struct FanOut {
    /// Connections whose mailbox accepted the payload.
    pub delivered: usize,
    /// Matching connections that could not take the payload.
    pub evicted: Vec<ConnectionKey>,
}

/// Registry of live connections keyed by token.
pub struct Hub {
    connections: RwLock<HashMap<String, Connection>>,
}

impl Hub {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection under its token.
    ///
    /// Last write wins. A live envelope already holding the token is dropped,
    /// which closes its mailbox; its key is returned.
    pub fn register(&self, connection: Connection) -> Option<ConnectionKey> {
        let key = connection.key().clone();
        let displaced = self
            .connections
            .write()
            .insert(key.token.clone(), connection);

        info!("Client {} registered", key.id);
        displaced.map(|old| {
            info!(
                "Client {} displaced by {} after {}s",
                old.key().id,
                key.id,
                old.age_secs()
            );
            old.key().clone()
        })
    }

    /// Remove the envelope addressed by `key`, closing its mailbox.
    ///
    /// Only removes when the stored envelope carries the same id, so a stale
    /// request for a displaced envelope is a no-op. Returns whether anything
    /// was removed.
    pub fn unregister(&self, key: &ConnectionKey) -> bool {
        let removed = {
            let mut connections = self.connections.write();
            let owned = connections
                .get(&key.token)
                .is_some_and(|current| current.key().id == key.id);
            if owned {
                connections.remove(&key.token)
            } else {
                None
            }
        };

        match removed {
            Some(connection) => {
                info!(
                    "Client {} unregistered after {}s",
                    key.id,
                    connection.age_secs()
                );
                true
            }
            None => {
                debug!("Client {} already unregistered", key.id);
                false
            }
        }
    }

    /// Get the key of the connection registered under `token`.
    pub fn lookup(&self, token: &str) -> Result<ConnectionKey> {
        self.connections
            .read()
            .get(token)
            .map(|connection| connection.key().clone())
            .ok_or_else(|| GatewayError::ClientNotFound(token.to_string()))
    }

    /// Enqueue a payload for the connection registered under `token`.
    pub fn deliver(&self, token: &str, payload: Bytes) -> Delivery {
        let connections = self.connections.read();
        let Some(connection) = connections.get(token) else {
            return Delivery::NotFound;
        };
        match connection.offer(payload) {
            Offer::Queued => Delivery::Queued,
            Offer::Full | Offer::Closed => Delivery::Evict(connection.key().clone()),
        }
    }

    /// Enqueue a payload for every connection whose identity matches `target`.
    ///
    /// Visits connections in map order under the read lock.
    pub fn fan_out(&self, payload: &Bytes, target: impl Fn(&Identity) -> bool) -> FanOut {
        let connections = self.connections.read();
        let mut report = FanOut::default();

        for connection in connections.values().filter(|c| target(c.identity())) {
            match connection.offer(payload.clone()) {
                Offer::Queued => report.delivered += 1,
                Offer::Full | Offer::Closed => report.evicted.push(connection.key().clone()),
            }
        }

        report
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
