use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

use crate::relay::RelayStats;
use crate::server::AppState;

pub const LIVENESS_BODY: &str = "Server is running";

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    #[serde(flatten)]
    relay: RelayStats,
}

pub async fn liveness() -> &'static str {
    LIVENESS_BODY
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        relay: state.relay.stats(),
    })
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
