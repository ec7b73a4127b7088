//! Agent wiring
//!
//! Builds every component from one [`AgentConfig`] and starts their tasks:
//! uploader actor (after restoring unfinished tasks), scan scheduler,
//! filesystem watcher, scratch cleaner and the event logger. All loops stop
//! on the shared cancellation token.

use crate::services::archive::{ArchiveExtractor, ScratchLeases};
use crate::services::cleaner::{spawn_cleaner, Cleaner};
use crate::services::content_store::ContentStore;
use crate::services::ingest_client::IngestApi;
use crate::services::scan_scheduler::{spawn_scheduler, SchedulerOptions, DEFAULT_UNIT_DEBOUNCE};
use crate::services::scanner::{Scanner, ScannerOptions};
use crate::services::uploader::{default_retry_schedule, spawn_uploader, UploaderOptions};
use crate::services::watcher::{
    start_watcher, UnitWatcher, WatchFilter, WatcherOptions, DEFAULT_COALESCE_WINDOW,
    DEFAULT_COLD_START,
};
use crate::AgentContext;
use anyhow::{Context, Result};
use medlog_common::config::{AgentConfig, PAYLOAD_EXTENSION};
use medlog_common::events::{AgentEvent, EventBus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_BUS_CAPACITY: usize = 256;
const TRIGGER_CHANNEL_CAPACITY: usize = 256;

/// Delays that tests shorten
#[derive(Debug, Clone)]
pub struct AgentTimings {
    pub retry_schedule: Vec<Duration>,
    pub coalesce_window: Duration,
    pub unit_debounce: Duration,
    pub cold_start: Duration,
}

impl Default for AgentTimings {
    fn default() -> Self {
        Self {
            retry_schedule: default_retry_schedule(),
            coalesce_window: DEFAULT_COALESCE_WINDOW,
            unit_debounce: DEFAULT_UNIT_DEBOUNCE,
            cold_start: DEFAULT_COLD_START,
        }
    }
}

/// Handles of a started agent
pub struct RunningAgent {
    pub context: AgentContext,
    /// Extra unit triggers (same channel the watcher feeds)
    pub triggers: mpsc::Sender<PathBuf>,
    watcher: Option<UnitWatcher>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl RunningAgent {
    /// Cancel all loops and wait for them to stop
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher {
            watcher.stop().await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Agent task ended abnormally");
                }
            }
        }
        tracing::info!("Agent stopped");
    }
}

pub async fn start_agent(
    config: AgentConfig,
    api: Arc<dyn IngestApi>,
    timings: AgentTimings,
    cancel: CancellationToken,
) -> Result<RunningAgent> {
    let temp_root = config.temp_dir();
    tokio::fs::create_dir_all(&temp_root)
        .await
        .with_context(|| format!("Failed to create {}", temp_root.display()))?;

    let store = ContentStore::open(config.db_path(), config.tasks_json_path()).await;
    tracing::info!(backend = store.backend().name(), "Task store ready");

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let last_error = Arc::new(RwLock::new(None));
    let mut tasks = Vec::new();
    tasks.push(spawn_event_logger(event_bus.clone(), last_error.clone(), cancel.clone()));

    let (uploader, uploader_task) = spawn_uploader(
        store.clone(),
        api.clone(),
        event_bus.clone(),
        UploaderOptions {
            concurrency: config.concurrency,
            retry_schedule: timings.retry_schedule.clone(),
            ..UploaderOptions::default()
        },
        cancel.clone(),
    );
    tasks.push(uploader_task);
    uploader
        .restore()
        .await
        .context("Uploader stopped during restore")?;

    let recurse_depth = config.recurse_depth as usize;
    let scratch_leases = ScratchLeases::default();
    let scanner = Scanner::new(
        ScannerOptions {
            extensions: config.include_extensions.clone(),
            key_file_name: config.key_file_name.clone(),
            recurse_depth,
        },
        ArchiveExtractor::new(temp_root.clone(), config.seven_zip_path.clone())
            .with_leases(scratch_leases.clone()),
        store.clone(),
        Some(api),
        Arc::new(uploader.clone()),
        event_bus.clone(),
    );

    let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
    let include_existing = !config.ignore_initial;
    let rescan_interval = match config.periodic_rescan_interval {
        0 => None,
        minutes => Some(Duration::from_secs(minutes * 60)),
    };
    tasks.push(spawn_scheduler(
        Arc::new(scanner),
        SchedulerOptions {
            roots: config.watch_paths.clone(),
            recurse_depth,
            include_existing,
            rescan_interval,
            debounce: timings.unit_debounce,
        },
        event_bus.clone(),
        trigger_rx,
        cancel.clone(),
    ));

    let context = AgentContext::new(Arc::new(config), store.clone(), uploader.clone(), event_bus.clone(), last_error);

    let watcher = match start_watcher(
        WatcherOptions {
            filter: WatchFilter {
                roots: context.config.watch_paths.clone(),
                extensions: context.config.include_extensions.clone(),
                recurse_depth,
            },
            include_existing,
            coalesce_window: timings.coalesce_window,
            cold_start: timings.cold_start,
        },
        trigger_tx.clone(),
        cancel.clone(),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::error!(error = %e, "Filesystem watcher unavailable, relying on periodic sweep");
            *context.last_error.write().await = Some(e.to_string());
            None
        }
    };

    let cleaner = Cleaner::new(
        temp_root,
        PAYLOAD_EXTENSION,
        store,
        Arc::new(uploader),
        scratch_leases,
        event_bus,
    );
    let cleanup_interval = Duration::from_secs(context.config.temp_cleanup_interval * 60);
    tasks.push(spawn_cleaner(cleaner, cleanup_interval, cancel.clone()));

    tracing::info!(
        watch_paths = context.config.watch_paths.len(),
        concurrency = context.config.concurrency,
        include_existing,
        "Agent started"
    );

    Ok(RunningAgent {
        context,
        triggers: trigger_tx,
        watcher,
        tasks,
        cancel,
    })
}

/// Logs agent events in place of desktop notifications and tracks the last
/// upload error for the health endpoint
fn spawn_event_logger(
    events: EventBus,
    last_error: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Event logger lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            };

            match &event {
                AgentEvent::UnitQueued { unit_path, .. } => {
                    tracing::info!(unit = %unit_path, "Log change detected");
                }
                AgentEvent::KeyMissing { unit_path, device_id, .. } => {
                    tracing::warn!(unit = %unit_path, device_id = ?device_id, "Decrypt key missing, unit not uploaded");
                }
                AgentEvent::DeviceUploadsCompleted { device_id, file_count, .. } => {
                    *last_error.write().await = None;
                    tracing::info!(device_id = %device_id, files = file_count, "Device logs uploaded");
                }
                AgentEvent::BatchUploaded { .. } => {
                    *last_error.write().await = None;
                }
                AgentEvent::BatchFailed { error, .. } => {
                    *last_error.write().await = Some(error.clone());
                }
                other => tracing::debug!(event = other.event_type(), "Agent event"),
            }
        }
    })
}
