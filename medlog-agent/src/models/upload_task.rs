//! Upload task model
//!
//! A task is one file waiting for (or finished with) transmission. Its
//! identity in the store is the logical path: the real path for plain files,
//! `{archive}!/{inner/path}` for files extracted from an archive.
//!
//! Status lifecycle: `pending → uploading → success | failed`, and
//! `failed → pending` only once the retry backoff elapses. `success` is
//! terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Upload task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a worker
    Pending,
    /// Part of a batch in flight
    Uploading,
    /// Accepted by the ingestion endpoint (terminal)
    Success,
    /// Last attempt failed; waiting for the backoff timer
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "uploading" => Some(TaskStatus::Uploading),
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Pending or uploading
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Uploading)
    }
}

/// A file the scanner wants uploaded
#[derive(Debug, Clone, PartialEq)]
pub struct FileCandidate {
    pub device_id: String,
    pub decrypt_key: String,
    /// SHA-256 hex; `None` when the file could not be hashed
    pub file_hash: Option<String>,
    /// Logical path (store identity)
    pub file_path: String,
    /// Real path read at transmit time
    pub upload_path: PathBuf,
    /// Modification time in epoch milliseconds
    pub mtime_ms: Option<i64>,
}

/// Upload task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: Uuid,
    pub device_id: String,
    pub decrypt_key: String,
    /// Logical path, unique in the store
    pub file_path: String,
    pub upload_path: PathBuf,
    pub file_hash: Option<String>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Source mtime at enqueue time; run-time only
    #[serde(skip)]
    pub mtime_ms: Option<i64>,
    /// Included in the session failure counter; run-time only
    #[serde(skip)]
    pub counted_failed: bool,
}

impl UploadTask {
    /// New pending task from a scanner candidate
    pub fn from_candidate(candidate: FileCandidate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            device_id: candidate.device_id,
            decrypt_key: candidate.decrypt_key,
            file_path: candidate.file_path,
            upload_path: candidate.upload_path,
            file_hash: candidate.file_hash,
            status: TaskStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            mtime_ms: candidate.mtime_ms,
            counted_failed: false,
        }
    }

    /// Path + mtime signature used as the secondary dedup key
    pub fn signature(&self) -> Option<String> {
        self.mtime_ms
            .map(|mtime| signature_for(&self.upload_path, mtime))
    }

    /// Move to `status`, refusing to leave `success`
    pub fn transition(&mut self, status: TaskStatus) -> bool {
        if self.status == TaskStatus::Success && status != TaskStatus::Success {
            return false;
        }
        self.status = status;
        self.updated_at = Utc::now();
        true
    }
}

/// `{upload_path}|{mtime_ms}`
pub fn signature_for(upload_path: &std::path::Path, mtime_ms: i64) -> String {
    format!("{}|{}", upload_path.display(), mtime_ms)
}

/// Session counters shown in the status API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

/// Task view without the decrypt key
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub device_id: String,
    pub file_path: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&UploadTask> for TaskSummary {
    fn from(task: &UploadTask) -> Self {
        Self {
            id: task.id,
            device_id: task.device_id.clone(),
            file_path: task.file_path.clone(),
            status: task.status,
            retry_count: task.retry_count,
            last_error: task.last_error.clone(),
            updated_at: task.updated_at,
        }
    }
}
