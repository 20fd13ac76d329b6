//! Consul HTTP API client.
//!
//! Covers the two things the gateway needs from Consul:
//! - Catalog lookup of the NATS endpoint at startup
//! - Announcing the gateway itself with a TTL health check, kept alive
//!   by a background heartbeat and removed on shutdown

pub mod catalog;
pub mod error;
pub mod registration;

pub use catalog::CatalogService;
pub use error::{ConsulError, Result};
pub use registration::ServiceRegistration;

use reqwest::Response;

/// Client for a Consul agent's HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
}

impl ConsulClient {
    /// Create a client for the agent at `base_url` (e.g. `http://127.0.0.1:8500`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turn a non-2xx response into [`ConsulError::Status`].
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ConsulError::Status {
        status: status.as_u16(),
        body,
    })
}
