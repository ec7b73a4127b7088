//! Queue status and upload concurrency

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use medlog_common::config::MAX_CONCURRENCY;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ApiResult;
use crate::services::uploader::QueueSnapshot;
use crate::AgentContext;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub queue: QueueSnapshot,
    /// Full history in the store, by status
    pub stored: BTreeMap<String, u64>,
    pub watch_paths: Vec<String>,
}

/// GET /status
pub async fn get_status(State(ctx): State<AgentContext>) -> ApiResult<Json<StatusResponse>> {
    let queue = ctx.uploader.snapshot().await?;
    let stored = ctx
        .store
        .count_by_status()
        .await?
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), count))
        .collect();

    Ok(Json(StatusResponse {
        queue,
        stored,
        watch_paths: ctx
            .config
            .watch_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyRequest {
    pub concurrency: i64,
}

#[derive(Debug, Serialize)]
pub struct ConcurrencyResponse {
    pub concurrency: u32,
    pub paused: bool,
}

/// POST /concurrency
///
/// Values are clamped to 0..=5; 0 pauses uploads.
pub async fn set_concurrency(
    State(ctx): State<AgentContext>,
    Json(request): Json<ConcurrencyRequest>,
) -> ApiResult<Json<ConcurrencyResponse>> {
    let concurrency = request.concurrency.clamp(0, MAX_CONCURRENCY as i64) as u32;
    ctx.uploader.set_concurrency(concurrency).await?;
    tracing::info!(concurrency, "Concurrency set through status API");

    Ok(Json(ConcurrencyResponse {
        concurrency,
        paused: concurrency == 0,
    }))
}

pub fn status_routes() -> Router<AgentContext> {
    Router::new()
        .route("/status", get(get_status))
        .route("/concurrency", post(set_concurrency))
}
