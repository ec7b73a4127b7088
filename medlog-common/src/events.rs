//! Agent events and the broadcast event bus
//!
//! Components emit [`AgentEvent`]s on a shared [`EventBus`]; the binary
//! subscribes and turns them into log lines (the agent's notification
//! surface), the status API can subscribe as well.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events raised by the agent's components
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// A unit was accepted into the scan queue (new or changed log content)
    UnitQueued {
        unit_path: String,
        timestamp: DateTime<Utc>,
    },

    /// A unit scan finished
    ScanCompleted {
        unit_path: String,
        files_seen: usize,
        queued: usize,
        duplicates: usize,
        skipped: usize,
        timestamp: DateTime<Utc>,
    },

    /// No decrypt key could be resolved; the unit's files were skipped
    KeyMissing {
        unit_path: String,
        device_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A batch was accepted by the ingestion endpoint
    BatchUploaded {
        device_id: String,
        file_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A batch failed and was scheduled for retry
    BatchFailed {
        device_id: String,
        file_count: usize,
        retry_in_secs: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Every queued file of a device reached success
    DeviceUploadsCompleted {
        device_id: String,
        file_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A scratch extraction directory was removed by the cleaner
    ScratchDirRemoved {
        path: String,
        timestamp: DateTime<Utc>,
    },
}

impl AgentEvent {
    /// Event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            AgentEvent::UnitQueued { .. } => "UnitQueued",
            AgentEvent::ScanCompleted { .. } => "ScanCompleted",
            AgentEvent::KeyMissing { .. } => "KeyMissing",
            AgentEvent::BatchUploaded { .. } => "BatchUploaded",
            AgentEvent::BatchFailed { .. } => "BatchFailed",
            AgentEvent::DeviceUploadsCompleted { .. } => "DeviceUploadsCompleted",
            AgentEvent::ScratchDirRemoved { .. } => "ScratchDirRemoved",
        }
    }
}

/// Broadcast bus for [`AgentEvent`]s
///
/// Cloning the bus shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per receiver
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}
