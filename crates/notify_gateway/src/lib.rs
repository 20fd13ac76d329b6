//! Gateway service relaying bus notifications to WebSocket clients.
//!
//! This service:
//! - Accepts WebSocket connections and authenticates them against the identity service
//! - Keeps one registry entry per authenticated token
//! - Subscribes to notifications via NATS
//! - Routes each notification to its receiver, a person, or an owning group
//!
//! ## Architecture
//!
//! ```text
//! NATS: notifications
//!         ↓
//! bus::forward (subscription → inbox)
//!         ↓
//! Dispatcher (single control loop, routing)
//!         ↓
//! Hub (RwLock-guarded token → connection map)
//!         ↓
//! write_pump per connection → WebSocket clients
//! ```
//!
//! ## Backpressure
//!
//! Every connection has a bounded mailbox. A client that cannot keep up is
//! evicted rather than slowing the dispatcher down.

pub mod auth;
pub mod bus;
pub mod client_ip;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod ws_server;

pub use auth::Authenticator;
pub use config::{ConnectionConfig, DispatchConfig, GatewayConfig};
pub use connection::{Connection, ConnectionKey, Identity};
pub use dispatcher::{Dispatcher, HubHandle};
pub use error::{GatewayError, Result};
pub use hub::Hub;
pub use identity::{HttpIdentityService, IdentityError, IdentityService};
pub use protocol::{BusMessage, Notification};
pub use ws_server::{create_router, AppState};
