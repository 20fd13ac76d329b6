//! Dispatcher: bus → WebSocket fan-out.
//!
//! One control loop owns every registry mutation and every routing decision.
//! It consumes register and unregister requests from the connection actors,
//! bus messages from the subscription, and the outcomes of delayed receiver
//! lookups.
//!
//! ## Routing
//!
//! First match wins:
//! 1. `to` field in the payload: direct delivery to that token, with one
//!    delayed retry if the token is not registered yet
//! 2. `person_id` header: every connection of that person
//! 3. `owner` header: every connection of that owning group
//!
//! A mailbox that cannot take a payload gets its connection unregistered.

use crate::config::DispatchConfig;
use crate::connection::{Connection, ConnectionKey, Identity};
use crate::error::{GatewayError, Result};
use crate::hub::{Delivery, Hub};
use crate::protocol::{BusMessage, Notification, OWNER_HEADER, PERSON_ID_HEADER};
use bytes::Bytes;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Buffer of the register and unregister queues.
const CONTROL_BUFFER: usize = 64;

/// Buffer of the bus inbox.
const INBOX_BUFFER: usize = 1024;

/// Sending side of the dispatcher's register/unregister queues.
///
/// Cloned into the authenticator and every connection actor.
#[derive(Clone)]
pub struct HubHandle {
    register: mpsc::Sender<Connection>,
    unregister: mpsc::Sender<ConnectionKey>,
}

impl HubHandle {
    pub fn new(
        register: mpsc::Sender<Connection>,
        unregister: mpsc::Sender<ConnectionKey>,
    ) -> Self {
        Self {
            register,
            unregister,
        }
    }

    /// Queue a connection for registration.
    pub async fn register(&self, connection: Connection) -> Result<()> {
        self.register.send(connection).await?;
        Ok(())
    }

    /// Queue the removal of a connection.
    pub async fn unregister(&self, key: ConnectionKey) -> Result<()> {
        self.unregister.send(key).await?;
        Ok(())
    }
}

/// Where a bus message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Receiver(&'a str),
    Person(&'a str),
    Owner(&'a str),
}

/// Pick the route for a parsed notification and its bus headers.
pub fn select_route<'a>(notification: &'a Notification, msg: &'a BusMessage) -> Result<Route<'a>> {
    if let Some(receiver) = notification.receiver() {
        return Ok(Route::Receiver(receiver));
    }

    if let Some(person_id) = msg.header(PERSON_ID_HEADER) {
        if Uuid::parse_str(person_id).is_err() {
            return Err(GatewayError::MalformedPersonId(person_id.to_string()));
        }
        return Ok(Route::Person(person_id));
    }

    msg.header(OWNER_HEADER)
        .map(Route::Owner)
        .ok_or(GatewayError::MissingRoutingKey)
}

/// Outcome of a receiver lookup task.
#[derive(Debug)]
enum Resolution {
    Delivered(String),
    Evict(ConnectionKey),
    Unresolved(GatewayError),
}

/// The registry's single control loop.
pub struct Dispatcher {
    hub: Arc<Hub>,
    config: DispatchConfig,
    register_rx: mpsc::Receiver<Connection>,
    unregister_rx: mpsc::Receiver<ConnectionKey>,
    inbox_rx: mpsc::Receiver<BusMessage>,
    /// In-flight receiver lookups.
    resolutions: JoinSet<Resolution>,
}

impl Dispatcher {
    /// Create a dispatcher over `hub`.
    ///
    /// Returns the dispatcher, the handle used by connections, and the
    /// sender feeding bus messages in.
    pub fn new(hub: Arc<Hub>, config: DispatchConfig) -> (Self, HubHandle, mpsc::Sender<BusMessage>) {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_BUFFER);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_BUFFER);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_BUFFER);

        let dispatcher = Self {
            hub,
            config,
            register_rx,
            unregister_rx,
            inbox_rx,
            resolutions: JoinSet::new(),
        };
        (
            dispatcher,
            HubHandle::new(register_tx, unregister_tx),
            inbox_tx,
        )
    }

    /// Run until `shutdown` fires or every input is closed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Dispatcher running");

        while self.step(&shutdown).await {}

        self.resolutions.shutdown().await;
        info!("Dispatcher stopped");
    }

    /// Handle one input. Returns `false` once the loop must stop.
    ///
    /// Register requests are polled before unregister requests so an envelope
    /// is never unregistered ahead of its own registration. Finished receiver
    /// lookups are settled before the next bus message, so evictions they
    /// report are not held back by a busy bus.
    async fn step(&mut self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Dispatcher received shutdown signal");
                false
            }

            Some(connection) = self.register_rx.recv() => {
                self.register(connection);
                true
            }

            Some(key) = self.unregister_rx.recv() => {
                self.unregister(&key);
                true
            }

            Some(result) = self.resolutions.join_next() => {
                self.settle(result);
                true
            }

            Some(msg) = self.inbox_rx.recv() => {
                self.route(msg);
                true
            }

            else => {
                warn!("All dispatcher inputs closed");
                false
            }
        }
    }

    fn register(&mut self, connection: Connection) {
        if let Some(displaced) = self.hub.register(connection) {
            debug!("Token re-registered, closed client {}", displaced.id);
        }
        gauge!("gateway_active_connections").set(self.hub.len() as f64);
    }

    fn unregister(&mut self, key: &ConnectionKey) {
        if self.hub.unregister(key) {
            gauge!("gateway_active_connections").set(self.hub.len() as f64);
        }
    }

    /// Drop a connection that could not take a payload.
    fn evict(&mut self, key: &ConnectionKey) {
        if self.hub.unregister(key) {
            warn!("Evicted slow client {}", key.id);
            counter!("gateway_evictions_total").increment(1);
            gauge!("gateway_active_connections").set(self.hub.len() as f64);
        }
    }

    /// Handle a single bus message.
    fn route(&mut self, msg: BusMessage) {
        counter!("gateway_bus_messages_total").increment(1);

        let mut notification: Notification = match serde_json::from_slice(&msg.payload) {
            Ok(notification) => notification,
            Err(e) => return self.report(GatewayError::from(e)),
        };
        // clients get the notification content only
        let content = Bytes::from(std::mem::take(&mut notification.content));

        match select_route(&notification, &msg) {
            Ok(Route::Receiver(token)) => {
                debug!("Routing {} notification to receiver", notification.kind);
                self.resolutions.spawn(resolve_receiver(
                    self.hub.clone(),
                    token.to_string(),
                    content,
                    self.config.receiver_grace,
                ));
            }
            Ok(Route::Person(person_id)) => {
                self.broadcast(&content, |identity| identity.person_id == person_id);
            }
            Ok(Route::Owner(owner)) => {
                self.broadcast(&content, |identity| identity.owner == owner);
            }
            Err(e) => self.report(e),
        }
    }

    /// Fan a payload out to every matching connection, evicting full ones.
    fn broadcast(&mut self, payload: &Bytes, target: impl Fn(&Identity) -> bool) {
        let report = self.hub.fan_out(payload, target);

        for key in &report.evicted {
            self.evict(key);
        }

        debug!(
            "Broadcast delivered to {} clients, {} evicted",
            report.delivered,
            report.evicted.len()
        );
        counter!("gateway_deliveries_total").increment(report.delivered as u64);
    }

    /// Apply the outcome of a receiver lookup.
    fn settle(&mut self, result: std::result::Result<Resolution, JoinError>) {
        match result {
            Ok(Resolution::Delivered(token)) => {
                debug!("Delivered notification to receiver {}", token);
                counter!("gateway_deliveries_total").increment(1);
            }
            Ok(Resolution::Evict(key)) => self.evict(&key),
            Ok(Resolution::Unresolved(e)) => self.report(e),
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!("Receiver lookup task failed: {}", e),
        }
    }

    fn report(&self, e: GatewayError) {
        warn!("Dropping bus message: {}", e);
        counter!("gateway_routing_errors_total", "reason" => e.reason()).increment(1);
    }
}

/// Look a receiver up, waiting `grace` once if it is not registered yet.
async fn resolve_receiver(hub: Arc<Hub>, token: String, payload: Bytes, grace: Duration) -> Resolution {
    if let Err(e) = hub.lookup(&token) {
        debug!("{}, retrying in {:?}", e, grace);
        tokio::time::sleep(grace).await;
        if let Err(e) = hub.lookup(&token) {
            return Resolution::Unresolved(e);
        }
    }

    match hub.deliver(&token, payload) {
        Delivery::Queued => Resolution::Delivered(token),
        Delivery::Evict(key) => Resolution::Evict(key),
        Delivery::NotFound => Resolution::Unresolved(GatewayError::ClientNotFound(token)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Mailbox;

    const ALICE: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    const BOB: &str = "16fd2706-8baf-433b-82eb-8c7fada847da";

    fn identity(person_id: &str, owner: &str) -> Identity {
        Identity {
            person_id: person_id.to_string(),
            owner: owner.to_string(),
        }
    }

    fn notification(receiver: Option<&str>, content: &str) -> Bytes {
        let notification = Notification {
            kind: "info".to_string(),
            title: "Notice".to_string(),
            content: content.to_string(),
            sender: None,
            receiver: receiver.map(str::to_string),
        };
        Bytes::from(serde_json::to_vec(&notification).unwrap())
    }

    fn setup() -> (Arc<Hub>, Dispatcher, HubHandle, mpsc::Sender<BusMessage>) {
        let hub = Arc::new(Hub::new());
        let (dispatcher, handle, inbox) = Dispatcher::new(hub.clone(), DispatchConfig::default());
        (hub, dispatcher, handle, inbox)
    }

    fn join(hub: &Hub, token: &str, identity: Identity, capacity: usize) -> Mailbox {
        let (connection, mailbox) = Connection::new(token, identity, capacity);
        hub.register(connection);
        mailbox
    }

    #[test]
    fn test_select_route_precedence() {
        let notification = Notification {
            receiver: Some("tok".to_string()),
            ..Default::default()
        };
        let msg = BusMessage::new("{}")
            .with_header(OWNER_HEADER, "acme")
            .with_header(PERSON_ID_HEADER, ALICE);
        assert_eq!(select_route(&notification, &msg).unwrap(), Route::Receiver("tok"));

        let notification = Notification::default();
        assert_eq!(select_route(&notification, &msg).unwrap(), Route::Person(ALICE));

        let msg = BusMessage::new("{}").with_header(OWNER_HEADER, "acme");
        assert_eq!(select_route(&notification, &msg).unwrap(), Route::Owner("acme"));

        let msg = BusMessage::new("{}");
        assert!(matches!(
            select_route(&notification, &msg),
            Err(GatewayError::MissingRoutingKey)
        ));
    }

    #[tokio::test]
    async fn test_owner_broadcast_reaches_matching_group_only() {
        let (hub, mut dispatcher, _handle, _inbox) = setup();
        let mut acme = join(&hub, "tok-acme", identity(ALICE, "acme"), 8);
        let mut other = join(&hub, "tok-other", identity(BOB, "other"), 8);

        dispatcher.route(BusMessage::new(notification(None, "hello")).with_header(OWNER_HEADER, "acme"));

        assert_eq!(acme.try_recv().unwrap(), Bytes::from_static(b"hello"));
        assert!(acme.try_recv().is_err());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_person_id_routes_to_person() {
        let (hub, mut dispatcher, _handle, _inbox) = setup();
        let mut alice_web = join(&hub, "tok-1", identity(ALICE, "acme"), 8);
        let mut alice_phone = join(&hub, "tok-2", identity(ALICE, "acme"), 8);
        let mut bob = join(&hub, "tok-3", identity(BOB, "acme"), 8);

        dispatcher.route(
            BusMessage::new(notification(None, "for alice"))
                .with_header(PERSON_ID_HEADER, ALICE)
                .with_header(OWNER_HEADER, "acme"),
        );

        assert_eq!(alice_web.try_recv().unwrap(), Bytes::from_static(b"for alice"));
        assert_eq!(alice_phone.try_recv().unwrap(), Bytes::from_static(b"for alice"));
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_person_id_is_dropped() {
        let (hub, mut dispatcher, _handle, _inbox) = setup();
        let mut mailbox = join(&hub, "tok", identity(ALICE, "acme"), 8);

        dispatcher.route(
            BusMessage::new(notification(None, "x"))
                .with_header(PERSON_ID_HEADER, "not-a-uuid")
                .with_header(OWNER_HEADER, "acme"),
        );

        assert!(mailbox.try_recv().is_err());
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_person_id_delivers_nothing() {
        let (hub, mut dispatcher, _handle, _inbox) = setup();
        let mut mailbox = join(&hub, "tok", identity(ALICE, "acme"), 8);

        dispatcher.route(BusMessage::new(notification(None, "x")).with_header(PERSON_ID_HEADER, BOB));

        assert!(mailbox.try_recv().is_err());
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_routing_key_and_malformed_payload_are_dropped() {
        let (hub, mut dispatcher, _handle, _inbox) = setup();
        let mut mailbox = join(&hub, "tok", identity(ALICE, "acme"), 8);

        dispatcher.route(BusMessage::new(notification(None, "x")));
        dispatcher.route(BusMessage::new("not json").with_header(OWNER_HEADER, "acme"));

        assert!(mailbox.try_recv().is_err());
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_receiver_takes_precedence_over_owner() {
        let (hub, mut dispatcher, _handle, _inbox) = setup();
        let mut target = join(&hub, "tok-1", identity(ALICE, "acme"), 8);
        let mut bystander = join(&hub, "tok-2", identity(BOB, "acme"), 8);

        let body = notification(Some("tok-1"), "direct");
        dispatcher.route(BusMessage::new(body).with_header(OWNER_HEADER, "acme"));
        let result = dispatcher.resolutions.join_next().await.unwrap();
        dispatcher.settle(result);

        assert_eq!(target.try_recv().unwrap(), Bytes::from_static(b"direct"));
        assert!(bystander.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_evicts_full_mailbox() {
        let (hub, mut dispatcher, _handle, _inbox) = setup();
        let mut slow = join(&hub, "slow", identity(ALICE, "acme"), 2);

        for i in 0..3 {
            let body = notification(None, &format!("m{i}"));
            dispatcher.route(BusMessage::new(body).with_header(OWNER_HEADER, "acme"));
        }

        assert!(hub.is_empty());
        assert!(hub.lookup("slow").is_err());
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_some());
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn test_receiver_with_full_mailbox_is_evicted() {
        let (hub, mut dispatcher, _handle, _inbox) = setup();
        let _mailbox = join(&hub, "tok", identity(ALICE, "acme"), 1);
        assert_eq!(hub.deliver("tok", Bytes::from_static(b"fill")), Delivery::Queued);

        dispatcher.route(BusMessage::new(notification(Some("tok"), "overflow")));
        let result = dispatcher.resolutions.join_next().await.unwrap();
        dispatcher.settle(result);

        assert!(hub.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_lookup_settles_before_queued_bus_messages() {
        let (hub, mut dispatcher, _handle, inbox) = setup();
        let _mailbox = join(&hub, "tok", identity(ALICE, "acme"), 1);
        assert_eq!(hub.deliver("tok", Bytes::from_static(b"fill")), Delivery::Queued);

        dispatcher.route(BusMessage::new(notification(Some("tok"), "overflow")));
        // let the lookup task finish
        tokio::time::sleep(Duration::from_millis(1)).await;

        for i in 0..10 {
            let body = notification(None, &format!("m{i}"));
            inbox
                .send(BusMessage::new(body).with_header(OWNER_HEADER, "other"))
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        assert!(dispatcher.step(&shutdown).await);

        assert!(hub.is_empty());
        assert_eq!(dispatcher.inbox_rx.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_registered_within_grace_is_delivered() {
        let (hub, dispatcher, handle, inbox) = setup();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        inbox
            .send(BusMessage::new(notification(Some("late"), "welcome")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let (connection, mut mailbox) = Connection::new("late", identity(ALICE, "acme"), 8);
        handle.register(connection).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(hub.len(), 1);
        assert_eq!(mailbox.try_recv().unwrap(), Bytes::from_static(b"welcome"));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_registered_after_grace_is_dropped() {
        let (hub, dispatcher, handle, inbox) = setup();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        inbox
            .send(BusMessage::new(notification(Some("late"), "welcome")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let (connection, mut mailbox) = Connection::new("late", identity(ALICE, "acme"), 8);
        handle.register(connection).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(hub.len(), 1);
        assert!(mailbox.try_recv().is_err());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_then_unregister_through_handle() {
        let (hub, dispatcher, handle, _inbox) = setup();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        let (connection, mut mailbox) = Connection::new("tok", identity(ALICE, "acme"), 8);
        let key = connection.key().clone();
        handle.register(connection).await.unwrap();
        handle.unregister(key.clone()).await.unwrap();
        handle.unregister(key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(hub.is_empty());
        assert_eq!(mailbox.recv().await, None);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_owner_fan_out() {
        let (hub, dispatcher, handle, inbox) = setup();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        let (first, mut first_mailbox) = Connection::new("tok-1", identity(ALICE, "acme"), 8);
        let (second, mut second_mailbox) = Connection::new("tok-2", identity(BOB, "other"), 8);
        handle.register(first).await.unwrap();
        handle.register(second).await.unwrap();

        inbox
            .send(BusMessage::new(notification(None, "hello")).with_header(OWNER_HEADER, "acme"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(hub.len(), 2);
        assert_eq!(first_mailbox.try_recv().unwrap(), Bytes::from_static(b"hello"));
        assert!(second_mailbox.try_recv().is_err());

        shutdown.cancel();
        task.await.unwrap();
    }
}
