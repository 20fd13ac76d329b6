//! Per-connection read and write actors.
//!
//! Each authenticated connection is split into a stream, read only by
//! [`read_pump`], and a sink, written only by [`write_pump`]. This keeps at
//! most one reader and one writer per connection. The two actors share a
//! [`Link`]; whichever ends first closes it and the other follows.

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionKey, Mailbox};
use crate::dispatcher::HubHandle;
use crate::error::{GatewayError, Result};
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Close signal shared by the two actors of one connection.
///
/// Closing is idempotent; either actor may close first.
#[derive(Debug, Clone, Default)]
pub struct Link {
    closed: CancellationToken,
}

impl Link {
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Read frames until the peer goes away, then unregister.
///
/// The read deadline starts at `pong_wait` and is pushed back by every pong.
/// Application frames are accepted and logged only.
pub async fn read_pump<R, E>(
    mut stream: R,
    key: ConnectionKey,
    hub: HubHandle,
    link: Link,
    config: ConnectionConfig,
) where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let next = tokio::select! {
            _ = link.closed() => break,
            next = timeout_at(deadline, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                debug!("Client {} missed the read deadline", key.id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!("WebSocket error for {}: {}", key.id, e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Pong(_) => deadline = Instant::now() + config.pong_wait,
            // axum answers pings on its own
            Message::Ping(_) => {}
            Message::Close(frame) => {
                log_close(&key, frame.as_ref());
                break;
            }
            Message::Text(text) => {
                if let Err(e) = check_size(text.as_str().len(), config.max_message_size) {
                    warn!("Client {}: {}", key.id, e);
                    break;
                }
                debug!("Message received from {}. Length: {}", key.id, text.as_str().len());
            }
            Message::Binary(data) => {
                if let Err(e) = check_size(data.len(), config.max_message_size) {
                    warn!("Client {}: {}", key.id, e);
                    break;
                }
                debug!("Message received from {}. Length: {}", key.id, data.len());
            }
        }
    }

    if let Err(e) = hub.unregister(key.clone()).await {
        warn!("Failed to unregister client {}: {}", key.id, e);
    }
    link.close();
}

/// Drain the mailbox to the peer and keep it alive with pings.
///
/// A closed mailbox means the hub dropped the connection: a close frame is
/// written and the actor ends.
pub async fn write_pump<S>(
    mut sink: S,
    mut mailbox: Mailbox,
    key: ConnectionKey,
    link: Link,
    config: ConnectionConfig,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = interval_at(Instant::now() + config.ping_period, config.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = link.closed() => break,

            payload = mailbox.recv() => {
                let Some(payload) = payload else {
                    debug!("Mailbox of {} closed, sending close frame", key.id);
                    let _ = write(&mut sink, Message::Close(None), config.write_wait).await;
                    break;
                };
                match write_batch(&mut sink, &mut mailbox, payload, config.write_wait).await {
                    Ok(count) => debug!("Wrote {} messages to {}", count, key.id),
                    Err(e) => {
                        warn!("Write to {} failed: {}", key.id, e);
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write(&mut sink, Message::Ping(Bytes::new()), config.write_wait).await {
                    warn!("Ping to {} failed: {}", key.id, e);
                    break;
                }
            }
        }
    }

    link.close();
    let _ = timeout(config.write_wait, sink.close()).await;
}

/// Write `first` plus everything already buffered in the mailbox, flushing once.
///
/// Only payloads present when the batch starts are taken, so a busy mailbox
/// cannot hold the actor inside one batch.
async fn write_batch<S>(
    sink: &mut S,
    mailbox: &mut Mailbox,
    first: Bytes,
    write_wait: Duration,
) -> Result<usize>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let batch = async {
        sink.feed(text_frame(first)).await?;
        let mut count = 1;

        for _ in 0..mailbox.len() {
            let Ok(payload) = mailbox.try_recv() else {
                break;
            };
            sink.feed(text_frame(payload)).await?;
            count += 1;
        }

        sink.flush().await?;
        Ok::<_, S::Error>(count)
    };

    match timeout(write_wait, batch).await {
        Ok(Ok(count)) => Ok(count),
        Ok(Err(e)) => Err(GatewayError::WebSocket(e.to_string())),
        Err(_) => Err(GatewayError::WriteTimeout),
    }
}

/// Write a single frame within the write deadline.
pub(crate) async fn write<S>(sink: &mut S, message: Message, write_wait: Duration) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(GatewayError::WebSocket(e.to_string())),
        Err(_) => Err(GatewayError::WriteTimeout),
    }
}

/// Bus payloads go out as text frames; non-UTF-8 payloads fall back to binary.
fn text_frame(payload: Bytes) -> Message {
    match Utf8Bytes::try_from(payload.clone()) {
        Ok(text) => Message::Text(text),
        Err(_) => Message::Binary(payload),
    }
}

pub(crate) fn check_size(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(GatewayError::FrameTooLarge(len));
    }
    Ok(())
}

/// Normal and going-away closes are expected; anything else is worth a warning.
fn log_close(key: &ConnectionKey, frame: Option<&CloseFrame>) {
    match frame {
        Some(frame) if frame.code != close_code::NORMAL && frame.code != close_code::AWAY => {
            warn!(
                "Client {} closed unexpectedly: {} {}",
                key.id,
                frame.code,
                frame.reason.as_str()
            );
        }
        _ => debug!("Client {} closed the connection", key.id),
    }
}
