//! Shared NATS client for the gateway services.

pub mod client;

pub use client::{NatsClient, DEFAULT_NATS_PORT};
