//! NATS client wrapper.

use anyhow::{Context, Result};
use async_nats::{Client, ConnectOptions, Subscriber};
use tracing::info;

/// Default client-facing NATS port, used when discovery yields no port.
pub const DEFAULT_NATS_PORT: u16 = 4222;

/// Wrapper around the NATS core client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to a NATS server, authenticating with a shared token if one is given.
    ///
    /// `name` is announced to the server and shows up in its connection list.
    pub async fn connect_with_token(url: &str, token: Option<&str>, name: &str) -> Result<Self> {
        let options = match token {
            Some(token) => ConnectOptions::with_token(token.to_string()),
            None => ConnectOptions::new(),
        };

        info!("Connecting to NATS at {}", url);
        let client = options
            .name(name)
            .connect(url)
            .await
            .with_context(|| format!("failed to connect to NATS at {url}"))?;

        Ok(Self { client })
    }

    /// Subscribe to a subject using NATS Core (push delivery).
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        info!("Subscribing to subject: {}", subject);
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("failed to subscribe to {subject}"))?;
        Ok(subscriber)
    }
}
