//! Agent services
//!
//! Leaf to root: key extraction and unit paths, content store, archive
//! extraction and the ingest client, then uploader, scanner, scheduler,
//! watcher and cleaner.

pub mod archive;
pub mod cleaner;
pub mod content_store;
pub mod ingest_client;
pub mod key_extractor;
pub mod scan_scheduler;
pub mod scanner;
pub mod units;
pub mod uploader;
pub mod watcher;

pub use cleaner::{spawn_cleaner, ActivityProbe, Cleaner, CleanupReport};
pub use content_store::{compute_hash, ContentStore, StoreBackend};
pub use ingest_client::{IngestApi, IngestClient, IngestError};
pub use scan_scheduler::{spawn_scheduler, SchedulerOptions};
pub use scanner::{ScanError, ScanSummary, Scanner, ScannerOptions, TaskSink, UnitScan};
pub use uploader::{
    spawn_uploader, EnqueueOutcome, QueueSnapshot, UploadActivity, UploaderHandle, UploaderOptions,
};
pub use watcher::{start_watcher, UnitWatcher, WatchFilter, WatcherOptions};
