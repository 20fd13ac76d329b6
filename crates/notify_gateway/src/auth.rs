//! Credential handshake for freshly upgraded connections.

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionKey};
use crate::dispatcher::HubHandle;
use crate::error::{GatewayError, Result};
use crate::identity::IdentityService;
use crate::protocol::{ErrorFrame, TokenAuth};
use crate::session::{check_size, read_pump, write, write_pump, Link};
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Authenticates connections and hands them to the hub.
#[derive(Clone)]
pub struct Authenticator {
    identity: Arc<dyn IdentityService>,
    hub: HubHandle,
    config: ConnectionConfig,
}

impl Authenticator {
    pub fn new(identity: Arc<dyn IdentityService>, hub: HubHandle, config: ConnectionConfig) -> Self {
        Self {
            identity,
            hub,
            config,
        }
    }

    /// Run the handshake on a split connection.
    ///
    /// The first data frame must be `{"token": "..."}`. A malformed frame or a
    /// credential the identity service rejects is answered with an error frame
    /// and the connection is closed. On success the connection is registered
    /// and its read and write actors are spawned.
    pub async fn authenticate<S, R, E>(
        &self,
        mut sink: S,
        mut stream: R,
        address: IpAddr,
    ) -> Result<ConnectionKey>
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display + Send,
        R: Stream<Item = std::result::Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let auth = match self.read_credential(&mut stream).await {
            Ok(auth) => auth,
            Err(e @ GatewayError::MalformedCredential(_)) => {
                self.reject(&mut sink, ErrorFrame::malformed_token()).await;
                return Err(e);
            }
            Err(e) => {
                counter!("gateway_auth_failures_total", "reason" => "handshake").increment(1);
                self.close(&mut sink).await;
                return Err(e);
            }
        };

        let identity = match self.identity.decode(address, &auth.token).await {
            Ok(identity) => identity,
            Err(e) => {
                self.reject(&mut sink, ErrorFrame::authorization(&e)).await;
                return Err(e.into());
            }
        };

        let (connection, mailbox) =
            Connection::new(auth.token, identity, self.config.mailbox_capacity);
        let key = connection.key().clone();
        info!(
            "Client {} authenticated from {} (owner {})",
            key.id,
            address,
            connection.identity().owner
        );

        self.hub.register(connection).await?;

        let link = Link::default();
        tokio::spawn(read_pump(
            stream,
            key.clone(),
            self.hub.clone(),
            link.clone(),
            self.config,
        ));
        tokio::spawn(write_pump(sink, mailbox, key.clone(), link, self.config));

        Ok(key)
    }

    /// Wait for the first data frame and parse it as a token payload.
    async fn read_credential<R, E>(&self, stream: &mut R) -> Result<TokenAuth>
    where
        R: Stream<Item = std::result::Result<Message, E>> + Unpin,
        E: Display,
    {
        let first = async {
            loop {
                match stream.next().await {
                    None | Some(Ok(Message::Close(_))) => return Err(GatewayError::ConnectionClosed),
                    Some(Err(e)) => return Err(GatewayError::WebSocket(e.to_string())),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Text(text))) => return Ok(text.as_str().as_bytes().to_vec()),
                    Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                }
            }
        };

        let frame = timeout(self.config.pong_wait, first)
            .await
            .map_err(|_| GatewayError::ReadTimeout)??;
        check_size(frame.len(), self.config.max_message_size)?;

        serde_json::from_slice(&frame).map_err(|e| GatewayError::MalformedCredential(e.to_string()))
    }

    /// Send an error frame, then close.
    async fn reject<S>(&self, sink: &mut S, frame: ErrorFrame)
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        warn!("Rejecting connection: {}", frame.error);
        counter!("gateway_auth_failures_total", "reason" => "rejected").increment(1);

        let message = Message::Text(frame.to_json().into());
        if let Err(e) = write(sink, message, self.config.write_wait).await {
            debug!("Failed to send error frame: {}", e);
        }
        self.close(sink).await;
    }

    async fn close<S>(&self, sink: &mut S)
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let _ = write(sink, Message::Close(None), self.config.write_wait).await;
        let _ = timeout(self.config.write_wait, sink.close()).await;
    }
}
