//! Bridge from the NATS subscription into the dispatcher inbox.

use crate::protocol::{BusMessage, OWNER_HEADER, PERSON_ID_HEADER};
use async_nats::HeaderMap;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

impl From<async_nats::Message> for BusMessage {
    fn from(msg: async_nats::Message) -> Self {
        bus_message(msg.payload, msg.headers.as_ref())
    }
}

/// Build a bus envelope, keeping the routing headers.
pub fn bus_message(payload: Bytes, headers: Option<&HeaderMap>) -> BusMessage {
    let mut msg = BusMessage::new(payload);
    if let Some(headers) = headers {
        for name in [PERSON_ID_HEADER, OWNER_HEADER] {
            if let Some(value) = headers.get(name) {
                msg = msg.with_header(name, value.as_str());
            }
        }
    }
    msg
}

/// Pump subscription messages into the dispatcher inbox.
///
/// Ends on shutdown, when the subscription ends, or when the dispatcher is gone.
pub async fn forward<S, M>(mut subscription: S, inbox: mpsc::Sender<BusMessage>, shutdown: CancellationToken)
where
    S: Stream<Item = M> + Unpin,
    M: Into<BusMessage>,
{
    info!("Bus forwarder running");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Bus forwarder received shutdown signal");
                break;
            }

            msg = subscription.next() => {
                let Some(msg) = msg else {
                    warn!("NATS subscription ended unexpectedly");
                    break;
                };
                if inbox.send(msg.into()).await.is_err() {
                    warn!("Dispatcher inbox closed");
                    break;
                }
            }
        }
    }

    info!("Bus forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_headers_carried_over() {
        let mut headers = HeaderMap::new();
        headers.insert("person_id", "5f0c6f2e-2b8a-4e0b-9a55-3c1d9d1f6b20");
        headers.insert("owner", "acme");
        headers.insert("trace", "ignored");

        let msg = bus_message(Bytes::from_static(b"{}"), Some(&headers));
        assert_eq!(msg.header(PERSON_ID_HEADER), Some("5f0c6f2e-2b8a-4e0b-9a55-3c1d9d1f6b20"));
        assert_eq!(msg.header(OWNER_HEADER), Some("acme"));
        assert_eq!(msg.headers.len(), 2);
        assert_eq!(msg.payload, Bytes::from_static(b"{}"));
    }

    #[test]
    fn test_no_headers() {
        let msg = bus_message(Bytes::from_static(b"{}"), None);
        assert!(msg.headers.is_empty());
    }

    #[tokio::test]
    async fn test_forward_until_subscription_ends() {
        let (inbox_tx, mut inbox_rx) = mpsc::channel(8);
        let messages = vec![
            BusMessage::new("one").with_header(OWNER_HEADER, "acme"),
            BusMessage::new("two"),
        ];

        forward(futures::stream::iter(messages), inbox_tx, CancellationToken::new()).await;

        assert_eq!(inbox_rx.recv().await.unwrap().header(OWNER_HEADER), Some("acme"));
        assert_eq!(inbox_rx.recv().await.unwrap().payload, Bytes::from_static(b"two"));
        // sender dropped when the forwarder returned
        assert!(inbox_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_forward_stops_on_shutdown() {
        let (inbox_tx, _inbox_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        forward(futures::stream::pending::<BusMessage>(), inbox_tx, shutdown).await;
    }
}
