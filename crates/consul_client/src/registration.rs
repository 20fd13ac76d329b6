//! Agent service registration with a TTL health check.

use crate::error::Result;
use crate::{check_status, ConsulClient};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default TTL of the registration's health check.
pub const DEFAULT_REGISTER_TTL: Duration = Duration::from_secs(30);

/// Default period between re-announcements.
pub const DEFAULT_REGISTER_INTERVAL: Duration = Duration::from_secs(10);

/// A service instance to announce in Consul.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    /// Unique instance id (`{name}-{uuid}`).
    pub id: String,
    pub name: String,
    pub version: String,
    pub port: u16,
    /// Consul marks the instance critical if not refreshed within this window.
    pub ttl: Duration,
    /// How often the instance is re-announced and its check passed.
    pub interval: Duration,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>, version: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        Self {
            id: format!("{}-{}", name, Uuid::new_v4()),
            name,
            version: version.into(),
            port,
            ttl: DEFAULT_REGISTER_TTL,
            interval: DEFAULT_REGISTER_INTERVAL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Id of the TTL check attached to this instance.
    pub fn check_id(&self) -> String {
        format!("service:{}", self.id)
    }

    fn payload(&self) -> AgentServiceRegister {
        AgentServiceRegister {
            id: self.id.clone(),
            name: self.name.clone(),
            tags: vec![format!("v={}", self.version)],
            meta: ServiceMeta {
                version: self.version.clone(),
            },
            port: self.port,
            check: AgentServiceCheck {
                check_id: self.check_id(),
                ttl: format!("{}s", self.ttl.as_secs()),
                deregister_critical_service_after: format!("{}s", self.ttl.as_secs() * 2),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct AgentServiceRegister {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
    #[serde(rename = "Meta")]
    meta: ServiceMeta,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Check")]
    check: AgentServiceCheck,
}

#[derive(Debug, Serialize)]
struct ServiceMeta {
    version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "TTL")]
    ttl: String,
    deregister_critical_service_after: String,
}

impl ConsulClient {
    /// Register (or re-register) a service instance with the local agent.
    pub async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let url = self.url("/v1/agent/service/register");
        let response = self
            .http
            .put(&url)
            .json(&registration.payload())
            .send()
            .await?;
        check_status(response).await?;
        debug!("Registered {} in Consul", registration.id);
        Ok(())
    }

    /// Mark the instance's TTL check as passing.
    pub async fn pass_ttl(&self, registration: &ServiceRegistration) -> Result<()> {
        let url = self.url(&format!("/v1/agent/check/pass/{}", registration.check_id()));
        check_status(self.http.put(&url).send().await?).await?;
        Ok(())
    }

    /// Remove the instance from the agent.
    pub async fn deregister(&self, registration: &ServiceRegistration) -> Result<()> {
        let url = self.url(&format!("/v1/agent/service/deregister/{}", registration.id));
        check_status(self.http.put(&url).send().await?).await?;
        Ok(())
    }

    /// Keep the instance announced until `shutdown` fires, then deregister it.
    ///
    /// Every `interval` the instance is re-registered and its check passed, so
    /// an agent restart or a missed heartbeat heals on the next tick.
    pub async fn keep_registered(
        self,
        registration: ServiceRegistration,
        shutdown: CancellationToken,
    ) {
        info!(
            "Announcing {} ({}) in Consul every {:?}",
            registration.name, registration.id, registration.interval
        );
        let mut ticker = tokio::time::interval(registration.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let announced = async {
                        self.register(&registration).await?;
                        self.pass_ttl(&registration).await
                    };
                    if let Err(e) = announced.await {
                        warn!("Failed to announce {} in Consul: {}", registration.id, e);
                    }
                }
            }
        }

        match self.deregister(&registration).await {
            Ok(()) => info!("Deregistered {} from Consul", registration.id),
            Err(e) => warn!("Failed to deregister {}: {}", registration.id, e),
        }
    }
}
