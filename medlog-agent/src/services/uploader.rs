//! Batching uploader
//!
//! The uploader is an actor: one task owns the live queue and every change
//! to it goes through [`UploaderHandle`] messages. Workers only transmit and
//! report back, so claiming a batch is atomic and two batches can never
//! contain the same task.
//!
//! **Enqueue dedup, in order:**
//! 1. same content hash already in the live queue, then recorded as
//!    successful in the store
//! 2. same `path|mtime` signature in the live queue
//! 3. logical path already successful in the store
//!
//! **Batches:** the first pending task plus every later pending task with the
//! same device id and decrypt key, at most [`MAX_BATCH_SIZE`].
//!
//! **Retry:** a failed batch becomes `pending` again after
//! `retry_schedule[min(retry_count, len) - 1]` (1 min, 5 min, 30 min by
//! default). There is no retry ceiling.

use crate::models::{FileCandidate, TaskCounters, TaskStatus, TaskSummary, UploadTask};
use crate::services::content_store::ContentStore;
use crate::services::ingest_client::{BatchFile, IngestApi, UploadBatch};
use crate::services::scanner::TaskSink;
use async_trait::async_trait;
use chrono::Utc;
use medlog_common::config::MAX_CONCURRENCY;
use medlog_common::events::{AgentEvent, EventBus};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Files per upload request
pub const MAX_BATCH_SIZE: usize = 20;

/// Successful tasks kept in the live queue after compaction
pub const MAX_LIVE_SUCCESSES: usize = 500;

/// Default escalating retry delays
pub fn default_retry_schedule() -> Vec<Duration> {
    vec![
        Duration::from_secs(60),
        Duration::from_secs(300),
        Duration::from_secs(1800),
    ]
}

/// Delay before retry number `retry_count` (1-based), capped at the last step
pub fn retry_delay(schedule: &[Duration], retry_count: u32) -> Duration {
    if schedule.is_empty() {
        return Duration::ZERO;
    }
    let idx = (retry_count.max(1) as usize).min(schedule.len()) - 1;
    schedule[idx]
}

#[derive(Debug, Error)]
pub enum UploaderError {
    #[error("Uploader is not running")]
    Closed,
}

/// Result of an enqueue request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnqueueOutcome {
    Accepted,
    /// Same content is already queued or uploaded
    DuplicateContent,
    /// Same path and mtime already queued
    DuplicateSignature,
    /// Logical path already uploaded
    AlreadyUploaded,
}

/// Uploader tuning
#[derive(Debug, Clone)]
pub struct UploaderOptions {
    pub concurrency: u32,
    pub max_batch_size: usize,
    pub retry_schedule: Vec<Duration>,
    pub max_live_successes: usize,
    pub compaction_interval: Duration,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_batch_size: MAX_BATCH_SIZE,
            retry_schedule: default_retry_schedule(),
            max_live_successes: MAX_LIVE_SUCCESSES,
            compaction_interval: Duration::from_secs(60),
        }
    }
}

/// Live queue view for the status API
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub counters: TaskCounters,
    pub concurrency: u32,
    pub active_batches: usize,
    pub pending: usize,
    pub uploading: usize,
    pub failed: usize,
    pub success: usize,
    pub tasks: Vec<TaskSummary>,
}

/// What the cleaner must not pull out from under the uploader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadActivity {
    /// Any task pending or uploading
    pub active: bool,
    /// Source files of every task not yet uploaded, failed ones included
    pub unfinished: Vec<PathBuf>,
}

enum Message {
    Enqueue {
        candidate: FileCandidate,
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    Restore {
        reply: oneshot::Sender<usize>,
    },
    SetConcurrency(u32),
    Snapshot(oneshot::Sender<QueueSnapshot>),
    Activity(oneshot::Sender<UploadActivity>),
    BatchDone {
        task_ids: Vec<Uuid>,
        result: Result<(), String>,
    },
    RetryDue {
        task_ids: Vec<Uuid>,
    },
}

/// Cloneable handle to the uploader actor
#[derive(Clone)]
pub struct UploaderHandle {
    tx: mpsc::Sender<Message>,
}

impl UploaderHandle {
    pub async fn enqueue(&self, candidate: FileCandidate) -> Result<EnqueueOutcome, UploaderError> {
        let (reply, rx) = oneshot::channel();
        self.request(Message::Enqueue { candidate, reply }, rx).await
    }

    /// Re-queue unfinished tasks from the store; returns how many
    pub async fn restore(&self) -> Result<usize, UploaderError> {
        let (reply, rx) = oneshot::channel();
        self.request(Message::Restore { reply }, rx).await
    }

    /// 0 pauses uploading; values above the maximum are clamped
    pub async fn set_concurrency(&self, concurrency: u32) -> Result<(), UploaderError> {
        self.tx
            .send(Message::SetConcurrency(concurrency))
            .await
            .map_err(|_| UploaderError::Closed)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, UploaderError> {
        let (reply, rx) = oneshot::channel();
        self.request(Message::Snapshot(reply), rx).await
    }

    pub async fn activity(&self) -> Result<UploadActivity, UploaderError> {
        let (reply, rx) = oneshot::channel();
        self.request(Message::Activity(reply), rx).await
    }

    async fn request<T>(
        &self,
        message: Message,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, UploaderError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| UploaderError::Closed)?;
        rx.await.map_err(|_| UploaderError::Closed)
    }
}

#[async_trait]
impl TaskSink for UploaderHandle {
    async fn submit(&self, candidate: FileCandidate) -> bool {
        match self.enqueue(candidate).await {
            Ok(EnqueueOutcome::Accepted) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Could not hand file to uploader");
                false
            }
        }
    }
}

/// Start the uploader actor
pub fn spawn_uploader(
    store: ContentStore,
    api: Arc<dyn IngestApi>,
    events: EventBus,
    options: UploaderOptions,
    cancel: CancellationToken,
) -> (UploaderHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let uploader = Uploader {
        queue: Vec::new(),
        counters: TaskCounters::default(),
        active_batches: 0,
        concurrency: options.concurrency.min(MAX_CONCURRENCY),
        store,
        api,
        events,
        options,
        self_tx: tx.clone(),
        cancel: cancel.clone(),
    };
    let join = tokio::spawn(uploader.run(rx, cancel));
    (UploaderHandle { tx }, join)
}

struct Uploader {
    queue: Vec<UploadTask>,
    counters: TaskCounters,
    active_batches: usize,
    concurrency: u32,
    store: ContentStore,
    api: Arc<dyn IngestApi>,
    events: EventBus,
    options: UploaderOptions,
    self_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl Uploader {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>, cancel: CancellationToken) {
        let mut compaction = tokio::time::interval(self.options.compaction_interval);
        compaction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(concurrency = self.concurrency, "Uploader started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                _ = compaction.tick() => self.compact(),
            }
        }
        tracing::info!(
            active_batches = self.active_batches,
            "Uploader stopped"
        );
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Enqueue { candidate, reply } => {
                let outcome = self.enqueue(candidate).await;
                let _ = reply.send(outcome);
                self.pump().await;
            }
            Message::Restore { reply } => {
                let restored = self.restore().await;
                let _ = reply.send(restored);
                self.pump().await;
            }
            Message::SetConcurrency(n) => {
                self.concurrency = n.min(MAX_CONCURRENCY);
                tracing::info!(concurrency = self.concurrency, "Upload concurrency changed");
                self.pump().await;
            }
            Message::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Message::Activity(reply) => {
                let _ = reply.send(self.activity());
            }
            Message::BatchDone { task_ids, result } => {
                self.active_batches = self.active_batches.saturating_sub(1);
                match result {
                    Ok(()) => self.complete_batch(&task_ids).await,
                    Err(error) => self.fail_batch(&task_ids, error).await,
                }
                self.pump().await;
            }
            Message::RetryDue { task_ids } => {
                self.requeue(&task_ids).await;
                self.pump().await;
            }
        }
    }

    async fn enqueue(&mut self, candidate: FileCandidate) -> EnqueueOutcome {
        if let Some(hash) = candidate.file_hash.as_deref() {
            if self.queue.iter().any(|t| t.file_hash.as_deref() == Some(hash)) {
                return EnqueueOutcome::DuplicateContent;
            }
            match self.store.has_succeeded_by_hash(hash).await {
                Ok(true) => return EnqueueOutcome::DuplicateContent,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Hash lookup failed, continuing"),
            }
        }

        let task = UploadTask::from_candidate(candidate);
        if let Some(signature) = task.signature() {
            if self
                .queue
                .iter()
                .any(|t| t.signature().as_deref() == Some(signature.as_str()))
            {
                return EnqueueOutcome::DuplicateSignature;
            }
        }

        match self.store.has_succeeded_by_path(&task.file_path).await {
            Ok(true) => return EnqueueOutcome::AlreadyUploaded,
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Path lookup failed, continuing"),
        }

        tracing::debug!(
            file = %task.file_path,
            device_id = %task.device_id,
            "Task queued"
        );
        if let Err(e) = self.store.save(std::slice::from_ref(&task)).await {
            tracing::warn!(error = %e, "Could not persist new task");
        }
        self.counters.total += 1;
        self.queue.push(task);
        EnqueueOutcome::Accepted
    }

    async fn restore(&mut self) -> usize {
        let stored = match self.store.load().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load stored tasks");
                return 0;
            }
        };

        let known: HashSet<String> = self.queue.iter().map(|t| t.file_path.clone()).collect();
        let mut waiting: HashMap<u32, Vec<Uuid>> = HashMap::new();
        let mut restored = 0usize;

        for mut task in stored {
            if task.status == TaskStatus::Success || known.contains(&task.file_path) {
                continue;
            }
            if task.device_id.is_empty() || task.decrypt_key.is_empty() {
                tracing::warn!(file = %task.file_path, "Stored task lacks device id or key, not restored");
                continue;
            }
            if !task.upload_path.exists() {
                tracing::warn!(
                    file = %task.file_path,
                    source = %task.upload_path.display(),
                    "Source of stored task is gone, not restored"
                );
                continue;
            }

            self.counters.total += 1;
            if task.status == TaskStatus::Failed {
                self.counters.failed += 1;
                task.counted_failed = true;
                waiting.entry(task.retry_count).or_default().push(task.id);
            }
            self.queue.push(task);
            restored += 1;
        }

        for (retry_count, task_ids) in waiting {
            let delay = retry_delay(&self.options.retry_schedule, retry_count);
            self.schedule_retry(task_ids, delay);
        }

        if restored > 0 {
            tracing::info!(restored, "Restored unfinished uploads");
        }
        restored
    }

    /// Claim batches while worker slots are free
    async fn pump(&mut self) {
        while self.active_batches < self.concurrency as usize {
            let Some(indices) = self.claim_batch() else {
                break;
            };

            let mut claimed = Vec::with_capacity(indices.len());
            for idx in indices {
                let task = &mut self.queue[idx];
                task.transition(TaskStatus::Uploading);
                claimed.push(task.clone());
            }
            if let Err(e) = self.store.save(&claimed).await {
                tracing::warn!(error = %e, "Could not persist uploading status");
            }

            self.active_batches += 1;
            self.spawn_worker(claimed);
        }
    }

    /// Indices of the next batch, all still `pending`
    fn claim_batch(&self) -> Option<Vec<usize>> {
        let first = self
            .queue
            .iter()
            .position(|t| t.status == TaskStatus::Pending)?;
        let head = &self.queue[first];

        let indices = self
            .queue
            .iter()
            .enumerate()
            .skip(first)
            .filter(|(_, t)| {
                t.status == TaskStatus::Pending
                    && t.device_id == head.device_id
                    && t.decrypt_key == head.decrypt_key
            })
            .map(|(i, _)| i)
            .take(self.options.max_batch_size.max(1))
            .collect();
        Some(indices)
    }

    fn spawn_worker(&self, tasks: Vec<UploadTask>) {
        let Some(head) = tasks.first() else {
            return;
        };
        let batch = UploadBatch {
            device_id: head.device_id.clone(),
            decrypt_key: head.decrypt_key.clone(),
            files: tasks
                .iter()
                .map(|t| BatchFile {
                    path: t.upload_path.clone(),
                    file_name: t
                        .upload_path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| t.file_path.clone()),
                })
                .collect(),
        };
        let task_ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        let api = self.api.clone();
        let tx = self.self_tx.clone();

        tracing::info!(
            device_id = %batch.device_id,
            files = batch.files.len(),
            "Uploading batch"
        );
        tokio::spawn(async move {
            let result = api.upload_batch(&batch).await.map_err(|e| e.to_string());
            let _ = tx.send(Message::BatchDone { task_ids, result }).await;
        });
    }

    async fn complete_batch(&mut self, task_ids: &[Uuid]) {
        let ids: HashSet<&Uuid> = task_ids.iter().collect();
        let mut updated = Vec::new();
        let mut device_id = None;

        for task in self.queue.iter_mut().filter(|t| ids.contains(&t.id)) {
            if task.status == TaskStatus::Success {
                continue;
            }
            task.transition(TaskStatus::Success);
            task.last_error = None;

            self.counters.success += 1;
            if task.counted_failed {
                task.counted_failed = false;
                self.counters.failed = self.counters.failed.saturating_sub(1);
            }
            device_id.get_or_insert_with(|| task.device_id.clone());
            updated.push(task.clone());
        }

        if let Err(e) = self.store.save(&updated).await {
            tracing::warn!(error = %e, "Could not persist successful uploads");
        }

        let Some(device_id) = device_id else {
            return;
        };
        tracing::info!(device_id = %device_id, files = updated.len(), "Batch uploaded");
        self.events.emit_lossy(AgentEvent::BatchUploaded {
            device_id: device_id.clone(),
            file_count: updated.len(),
            timestamp: Utc::now(),
        });

        let device_tasks: Vec<&UploadTask> = self
            .queue
            .iter()
            .filter(|t| t.device_id == device_id)
            .collect();
        if device_tasks.iter().all(|t| t.status == TaskStatus::Success) {
            self.events.emit_lossy(AgentEvent::DeviceUploadsCompleted {
                device_id,
                file_count: device_tasks.len(),
                timestamp: Utc::now(),
            });
        }
    }

    async fn fail_batch(&mut self, task_ids: &[Uuid], error: String) {
        let ids: HashSet<&Uuid> = task_ids.iter().collect();
        let mut updated = Vec::new();
        let mut max_retry = 0u32;

        for task in self.queue.iter_mut().filter(|t| ids.contains(&t.id)) {
            if !task.transition(TaskStatus::Failed) {
                continue;
            }
            task.retry_count += 1;
            task.last_error = Some(error.clone());
            if !task.counted_failed {
                task.counted_failed = true;
                self.counters.failed += 1;
            }
            max_retry = max_retry.max(task.retry_count);
            updated.push(task.clone());
        }

        if let Err(e) = self.store.save(&updated).await {
            tracing::warn!(error = %e, "Could not persist failed uploads");
        }
        let Some(head) = updated.first() else {
            return;
        };

        let delay = retry_delay(&self.options.retry_schedule, max_retry);
        tracing::warn!(
            device_id = %head.device_id,
            files = updated.len(),
            retry_count = max_retry,
            retry_in_secs = delay.as_secs(),
            error = %error,
            "Batch upload failed"
        );
        self.events.emit_lossy(AgentEvent::BatchFailed {
            device_id: head.device_id.clone(),
            file_count: updated.len(),
            retry_in_secs: delay.as_secs(),
            error,
            timestamp: Utc::now(),
        });

        self.schedule_retry(updated.iter().map(|t| t.id).collect(), delay);
    }

    fn schedule_retry(&self, task_ids: Vec<Uuid>, delay: Duration) {
        let tx = self.self_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Message::RetryDue { task_ids }).await;
                }
            }
        });
    }

    async fn requeue(&mut self, task_ids: &[Uuid]) {
        let ids: HashSet<&Uuid> = task_ids.iter().collect();
        let mut updated = Vec::new();
        for task in self
            .queue
            .iter_mut()
            .filter(|t| ids.contains(&t.id) && t.status == TaskStatus::Failed)
        {
            task.transition(TaskStatus::Pending);
            updated.push(task.clone());
        }
        if updated.is_empty() {
            return;
        }
        tracing::info!(files = updated.len(), "Retrying failed uploads");
        if let Err(e) = self.store.save(&updated).await {
            tracing::warn!(error = %e, "Could not persist retry status");
        }
    }

    /// Drop all but the most recently updated successes from the live queue
    fn compact(&mut self) {
        let mut successes: Vec<(chrono::DateTime<Utc>, Uuid)> = self
            .queue
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .map(|t| (t.updated_at, t.id))
            .collect();
        if successes.len() <= self.options.max_live_successes {
            return;
        }

        successes.sort_by(|a, b| b.0.cmp(&a.0));
        let evict: HashSet<Uuid> = successes
            .into_iter()
            .skip(self.options.max_live_successes)
            .map(|(_, id)| id)
            .collect();
        let before = self.queue.len();
        self.queue.retain(|t| !evict.contains(&t.id));
        tracing::debug!(evicted = before - self.queue.len(), "Compacted live queue");
    }

    fn activity(&self) -> UploadActivity {
        UploadActivity {
            active: self.queue.iter().any(|t| t.status.is_active()),
            unfinished: self
                .queue
                .iter()
                .filter(|t| t.status != TaskStatus::Success)
                .map(|t| t.upload_path.clone())
                .collect(),
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        let count = |status: TaskStatus| self.queue.iter().filter(|t| t.status == status).count();
        QueueSnapshot {
            counters: self.counters,
            concurrency: self.concurrency,
            active_batches: self.active_batches,
            pending: count(TaskStatus::Pending),
            uploading: count(TaskStatus::Uploading),
            failed: count(TaskStatus::Failed),
            success: count(TaskStatus::Success),
            tasks: self.queue.iter().map(TaskSummary::from).collect(),
        }
    }
}
