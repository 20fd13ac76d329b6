//! Process and connection configuration.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Time allowed to write a frame (or a batch of frames) to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed to read the next pong from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Maximum frame size accepted from the peer.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Capacity of each connection's outbound mailbox.
pub const MAILBOX_CAPACITY: usize = 256;

/// How long a message addressed to an unknown receiver waits before the
/// single retry.
pub const RECEIVER_GRACE: Duration = Duration::from_secs(10);

/// Gateway process configuration, read from flags or environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "notify_gateway", version, about = "WebSocket notification gateway")]
pub struct GatewayConfig {
    /// HTTP service address.
    #[arg(long = "addr", env = "LISTEN_ADDR", default_value = "0.0.0.0:7070")]
    pub listen_addr: SocketAddr,

    /// Port of the Prometheus exporter.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9093)]
    pub metrics_port: u16,

    /// NATS URL; when unset the endpoint is discovered through Consul.
    #[arg(long, env = "NATS_URL")]
    pub nats_url: Option<String>,

    /// Token used to authenticate with NATS.
    #[arg(long, env = "NATS_TOKEN", hide_env_values = true)]
    pub nats_token: Option<String>,

    /// Consul service name of the NATS cluster.
    #[arg(long, env = "NATS_SERVICE", default_value = "nats")]
    pub nats_service: String,

    /// Subject carrying notifications.
    #[arg(long, env = "NATS_SUBJECT", default_value = "notifications")]
    pub nats_subject: String,

    /// Consul agent HTTP address.
    #[arg(long, env = "CONSUL_URL", default_value = "http://127.0.0.1:8500")]
    pub consul_url: String,

    /// Identity service endpoint that decodes client tokens.
    #[arg(long, env = "IDENTITY_URL", default_value = "http://127.0.0.1:8080/decode")]
    pub identity_url: String,

    /// Name announced in the service registry.
    #[arg(long, env = "SERVICE_NAME", default_value = "tms-websocket-service")]
    pub service_name: String,

    /// Version announced in the service registry.
    #[arg(long, env = "SERVICE_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub service_version: String,

    /// TTL of the registry health check, in seconds.
    #[arg(long, env = "REGISTER_TTL_SECS", default_value_t = 30)]
    pub register_ttl_secs: u64,

    /// Re-announcement period, in seconds.
    #[arg(long, env = "REGISTER_INTERVAL_SECS", default_value_t = 10)]
    pub register_interval_secs: u64,

    /// Do not announce the gateway in Consul.
    #[arg(long, env = "SKIP_REGISTRATION")]
    pub skip_registration: bool,
}

/// Per-connection timing and sizing.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    /// Ping period; must be shorter than `pong_wait`.
    pub ping_period: Duration,
    pub max_message_size: usize,
    pub mailbox_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PONG_WAIT * 9 / 10,
            max_message_size: MAX_MESSAGE_SIZE,
            mailbox_capacity: MAILBOX_CAPACITY,
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub receiver_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            receiver_grace: RECEIVER_GRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_period_within_pong_wait() {
        let config = ConnectionConfig::default();
        assert_eq!(config.ping_period, Duration::from_secs(54));
        assert!(config.ping_period < config.pong_wait);
    }

    #[test]
    fn test_config_defaults() {
        let config = GatewayConfig::parse_from(["notify_gateway"]);
        assert_eq!(config.listen_addr, "0.0.0.0:7070".parse().unwrap());
        assert_eq!(config.nats_subject, "notifications");
        assert_eq!(config.service_name, "tms-websocket-service");
        assert!(!config.skip_registration);
    }

    #[test]
    fn test_addr_flag() {
        let config = GatewayConfig::parse_from(["notify_gateway", "--addr", "127.0.0.1:9000"]);
        assert_eq!(config.listen_addr.port(), 9000);
    }
}
