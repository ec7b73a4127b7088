//! medlog-agent library interface
//!
//! Watches device log bundles, resolves their decrypt keys and uploads new
//! payload files to the ingestion server. Exposed as a library so the
//! integration tests can drive the pipeline with a fake server.

pub mod agent;
pub mod api;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use medlog_common::config::AgentConfig;
use medlog_common::events::EventBus;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::services::content_store::ContentStore;
use crate::services::uploader::UploaderHandle;

/// Agent state shared with the status API
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    pub store: ContentStore,
    pub uploader: UploaderHandle,
    pub event_bus: EventBus,
    pub startup_time: DateTime<Utc>,
    /// Last upload or watcher error, cleared by the next successful batch
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AgentContext {
    pub fn new(
        config: Arc<AgentConfig>,
        store: ContentStore,
        uploader: UploaderHandle,
        event_bus: EventBus,
        last_error: Arc<RwLock<Option<String>>>,
    ) -> Self {
        Self {
            config,
            store,
            uploader,
            event_bus,
            startup_time: Utc::now(),
            last_error,
        }
    }
}

/// Build the status API router
pub fn build_router(ctx: AgentContext) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::status_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
