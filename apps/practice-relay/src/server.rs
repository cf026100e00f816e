use anyhow::{Context, Result};
use axum::{
    http::{HeaderValue, Method},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::handlers::{health_check, liveness, metrics_handler};
use crate::relay::Relay;
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    /// Absent when no recorder is installed (tests, embedded use).
    pub metrics: Option<PrometheusHandle>,
}

pub fn build_router(state: AppState, allowed_origin: Option<&str>) -> Result<Router> {
    let cors = match allowed_origin {
        Some(origin) => {
            let origin = HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?;
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST])
        }
        None => CorsLayer::permissive(),
    };

    Ok(Router::new()
        .route("/", get(liveness))
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

/// Runs the relay until Ctrl-C, then clears its state and waits out the
/// grace period.
pub async fn run(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let relay = Relay::new(config.mode);
    let state = AppState {
        relay: relay.clone(),
        metrics,
    };
    let router = build_router(state, config.allowed_origin.as_deref())?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        listen_addr = %config.listen_addr,
        mode = %config.mode,
        "signaling relay listening"
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(relay.clone()))
    .await
    .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; waiting for grace period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal(relay: Relay) {
    let _ = signal::ctrl_c().await;
    relay.shutdown();
}
