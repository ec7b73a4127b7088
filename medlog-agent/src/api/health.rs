//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AgentContext;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while uploads are failing
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// "sqlite" or "json"
    pub store: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(ctx): State<AgentContext>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(ctx.startup_time);
    let last_error = ctx.last_error.read().await.clone();

    Json(HealthResponse {
        status: if last_error.is_some() { "degraded" } else { "ok" }.to_string(),
        module: "medlog-agent".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        store: ctx.store.backend().name().to_string(),
        last_error,
    })
}

pub fn health_routes() -> Router<AgentContext> {
    Router::new().route("/health", get(health_check))
}
