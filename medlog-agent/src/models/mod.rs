//! Data models for the upload agent

pub mod upload_task;

pub use upload_task::{FileCandidate, TaskCounters, TaskStatus, TaskSummary, UploadTask};
