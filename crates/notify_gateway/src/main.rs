//! Gateway service entry point.
//!
//! WebSocket gateway relaying NATS notifications to authenticated clients.

use anyhow::{Context, Result};
use clap::Parser;
use consul_client::{ConsulClient, ServiceRegistration};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::{NatsClient, DEFAULT_NATS_PORT};
use notify_gateway::{
    bus, create_router, AppState, Authenticator, ConnectionConfig, DispatchConfig, Dispatcher,
    GatewayConfig, HttpIdentityService, Hub,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::parse();
    info!("Starting {} {}", config.service_name, config.service_version);
    info!("Configuration:");
    info!("  LISTEN_ADDR: {}", config.listen_addr);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  NATS_SUBJECT: {}", config.nats_subject);
    info!("  CONSUL_URL: {}", config.consul_url);
    info!("  IDENTITY_URL: {}", config.identity_url);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let consul = ConsulClient::new(&config.consul_url);

    // Resolve and connect to NATS
    let nats_url = match &config.nats_url {
        Some(url) => url.clone(),
        None => consul
            .discover_nats(&config.nats_service, DEFAULT_NATS_PORT)
            .await
            .context("NATS discovery failed")?,
    };
    let nats_client =
        NatsClient::connect_with_token(&nats_url, config.nats_token.as_deref(), &config.service_name)
            .await?;
    let subscriber = nats_client.subscribe(&config.nats_subject).await?;
    info!("Subscribed to '{}'", config.nats_subject);

    let shutdown = CancellationToken::new();

    // Registry and dispatcher
    let hub = Arc::new(Hub::new());
    let (dispatcher, handle, inbox) = Dispatcher::new(hub.clone(), DispatchConfig::default());
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown.clone()));
    let bus_handle = tokio::spawn(bus::forward(subscriber, inbox, shutdown.clone()));

    // Service registry heartbeat
    let registry_handle = if config.skip_registration {
        info!("Service registration disabled");
        None
    } else {
        let registration = ServiceRegistration::new(
            &config.service_name,
            &config.service_version,
            config.listen_addr.port(),
        )
        .with_ttl(Duration::from_secs(config.register_ttl_secs))
        .with_interval(Duration::from_secs(config.register_interval_secs));
        Some(tokio::spawn(
            consul.clone().keep_registered(registration, shutdown.clone()),
        ))
    };

    // Create application state
    let connection_config = ConnectionConfig::default();
    let identity = Arc::new(HttpIdentityService::new(&config.identity_url));
    let state = Arc::new(AppState {
        hub,
        authenticator: Authenticator::new(identity, handle, connection_config),
        config: connection_config,
    });
    let app = create_router(state);

    // Start HTTP server
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Gateway listening on {}", config.listen_addr);

    // Run server with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Shutdown background tasks
    info!("Shutting down...");
    shutdown.cancel();
    let _ = dispatcher_handle.await;
    let _ = bus_handle.await;
    if let Some(handle) = registry_handle {
        let _ = handle.await;
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
