//! Catalog lookups used for service discovery.

use crate::error::{ConsulError, Result};
use crate::{check_status, ConsulClient};
use serde::Deserialize;
use tracing::{debug, info};

/// One node entry from `GET /v1/catalog/service/{name}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogService {
    /// Address of the node running the service.
    #[serde(default)]
    pub address: String,
    /// Address the service registered itself with, if different from the node.
    #[serde(default)]
    pub service_address: String,
    /// Port the service registered itself with (0 when unset).
    #[serde(default)]
    pub service_port: u16,
}

impl CatalogService {
    /// Host to connect to: the service address when set, the node address otherwise.
    pub fn host(&self) -> &str {
        if self.service_address.is_empty() {
            &self.address
        } else {
            &self.service_address
        }
    }
}

impl ConsulClient {
    /// List the catalog entries for a service.
    pub async fn catalog_service(&self, name: &str) -> Result<Vec<CatalogService>> {
        let url = self.url(&format!("/v1/catalog/service/{}", name));
        debug!("Querying Consul catalog: {}", url);

        let response = check_status(self.http.get(&url).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Resolve the NATS endpoint registered as `service`.
    ///
    /// Returns a `nats://host:port` URL from the first catalog entry.
    /// `default_port` is used when the entry carries no service port.
    pub async fn discover_nats(&self, service: &str, default_port: u16) -> Result<String> {
        let entry = self
            .catalog_service(service)
            .await?
            .into_iter()
            .find(|entry| !entry.host().is_empty())
            .ok_or_else(|| ConsulError::ServiceNotFound(service.to_string()))?;

        let port = match entry.service_port {
            0 => default_port,
            port => port,
        };
        let url = format!("nats://{}:{}", entry.host(), port);
        info!("Discovered {} at {}", service, url);
        Ok(url)
    }
}
