//! Arrakis gateway client service
//!
//! Runs every configured shard, logs the event stream and exposes
//! health/ready/metrics endpoints for Kubernetes.

use anyhow::Result;
use arrakis_gateway_client::config::ServiceConfig;
use arrakis_gateway_client::health::{self, AppState};
use arrakis_gateway_client::metrics::GatewayMetrics;
use arrakis_gateway_client::{Client, ClientOptions, ShardEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration first to get log level
    let service = ServiceConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_gateway_client={}", service.log_level).parse()?)
                .add_directive("tokio_tungstenite=warn".parse()?)
                .add_directive("tungstenite=warn".parse()?)
                .add_directive("reqwest=warn".parse()?)
                .add_directive("hyper=warn".parse()?),
        )
        .json()
        .init();

    let options = ClientOptions::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        encoding = options.ws.encoding.name(),
        shard_count = options.shards.shard_count,
        "Starting Arrakis gateway client"
    );

    let metrics = GatewayMetrics::install()?;
    info!("Prometheus metrics initialized");

    let client = Arc::new(Client::builder(options).metrics(metrics.clone()).build()?);

    // Health server comes up before login so probes answer while shards start
    let app_state = AppState {
        registry: client.registry(),
        metrics,
    };
    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], service.http_port).into();

    info!(port = service.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    let mut failure = None;
    tokio::select! {
        result = run(Arc::clone(&client)) => {
            if let Err(e) = result {
                error!(error = %e, "Gateway client error");
                failure = Some(e);
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
                failure = Some(e.into());
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down gateway client...");
    client.destroy().await;

    info!("Gateway client shutdown complete");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Log in and drain the event stream until a shard stops for good
async fn run(client: Arc<Client>) -> Result<()> {
    let mut events = client.login().await?;

    while let Some(event) = events.recv().await {
        if let ShardEvent::Terminated {
            shard_id,
            code,
            reason,
        } = event
        {
            error!(shard_id, code, reason = %reason, "Shard terminated");
            anyhow::bail!("shard {shard_id} terminated: {reason}");
        }
        debug!(
            shard_id = event.shard_id(),
            event = event.name(),
            "Event received"
        );
    }

    info!("Event stream closed");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
