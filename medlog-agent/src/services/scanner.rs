//! Unit scanner
//!
//! Scans one unit (directory or archive) and hands every new payload file to
//! the uploader. The unit key is resolved once per scan: first below the unit
//! root, then upward from the unit's parent, then through the key auto-fill
//! endpoint. Without a key nothing from the unit is queued.

use crate::models::FileCandidate;
use crate::services::archive::{is_scratch_path, ArchiveError, ArchiveExtractor};
use crate::services::content_store::{try_hash, ContentStore};
use crate::services::ingest_client::IngestApi;
use crate::services::key_extractor::{extract_device_id, find_key_downward, find_key_upward};
use crate::services::units::is_archive_path;
use async_trait::async_trait;
use chrono::Utc;
use medlog_common::events::{AgentEvent, EventBus};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Unit not found: {0}")]
    NotFound(PathBuf),

    #[error("Not a directory or archive: {0}")]
    NotAUnit(PathBuf),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Scan task failed: {0}")]
    Task(String),
}

/// Receives files found by the scanner; true when the file was accepted
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn submit(&self, candidate: FileCandidate) -> bool;
}

/// Anything the scheduler can hand a unit to
#[async_trait]
pub trait UnitScan: Send + Sync {
    async fn scan_unit(&self, unit: &Path) -> Result<ScanSummary, ScanError>;
}

/// Outcome of one unit scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub files_seen: usize,
    pub queued: usize,
    pub duplicates: usize,
    /// Files without key or device id
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct ScannerOptions {
    /// Lowercase, dot-prefixed
    pub extensions: Vec<String>,
    pub key_file_name: String,
    pub recurse_depth: usize,
}

pub struct Scanner {
    options: ScannerOptions,
    extractor: ArchiveExtractor,
    store: ContentStore,
    key_lookup: Option<Arc<dyn IngestApi>>,
    sink: Arc<dyn TaskSink>,
    events: EventBus,
}

/// One payload file found by the walk
#[derive(Debug, Clone)]
struct FoundFile {
    path: PathBuf,
    logical_path: String,
    mtime_ms: Option<i64>,
}

impl Scanner {
    pub fn new(
        options: ScannerOptions,
        extractor: ArchiveExtractor,
        store: ContentStore,
        key_lookup: Option<Arc<dyn IngestApi>>,
        sink: Arc<dyn TaskSink>,
        events: EventBus,
    ) -> Self {
        Self {
            options,
            extractor,
            store,
            key_lookup,
            sink,
            events,
        }
    }

    /// Scan `root` (a directory, or the scratch dir of `archive`)
    async fn scan_directory(
        &self,
        unit: &Path,
        root: &Path,
        archive: Option<&Path>,
    ) -> Result<ScanSummary, ScanError> {
        let unit_device = extract_device_id(unit);
        let files = self.walk(root, archive).await?;
        let mut summary = ScanSummary {
            files_seen: files.len(),
            ..ScanSummary::default()
        };
        if files.is_empty() {
            return Ok(summary);
        }

        let Some(key) = self.resolve_key(unit, root, unit_device.as_deref()).await else {
            tracing::warn!(
                unit = %unit.display(),
                device_id = ?unit_device,
                files = files.len(),
                "No decrypt key for unit, files skipped"
            );
            self.events.emit_lossy(AgentEvent::KeyMissing {
                unit_path: unit.display().to_string(),
                device_id: unit_device,
                timestamp: Utc::now(),
            });
            summary.skipped = files.len();
            return Ok(summary);
        };

        let (files, name_duplicates) = dedup_by_name(files);
        summary.duplicates += name_duplicates;

        for file in files {
            let device_id = unit_device
                .clone()
                .or_else(|| extract_device_id(Path::new(&file.logical_path)));
            let Some(device_id) = device_id else {
                tracing::debug!(file = %file.logical_path, "No device id, skipped");
                summary.skipped += 1;
                continue;
            };

            let file_hash = try_hash(&file.path).await;
            if let Some(hash) = file_hash.as_deref() {
                match self.store.has_succeeded_by_hash(hash).await {
                    Ok(true) => {
                        summary.duplicates += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "Hash lookup failed, continuing"),
                }
            }

            let accepted = self
                .sink
                .submit(FileCandidate {
                    device_id,
                    decrypt_key: key.clone(),
                    file_hash,
                    file_path: file.logical_path,
                    upload_path: file.path,
                    mtime_ms: file.mtime_ms,
                })
                .await;
            if accepted {
                summary.queued += 1;
            } else {
                summary.duplicates += 1;
            }
        }
        Ok(summary)
    }

    /// Payload files below `root` in name order
    async fn walk(&self, root: &Path, archive: Option<&Path>) -> Result<Vec<FoundFile>, ScanError> {
        let root = root.to_path_buf();
        let archive = archive.map(Path::to_path_buf);
        let extensions = self.options.extensions.clone();
        let max_depth = self.options.recurse_depth + 1;

        tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .max_depth(max_depth)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter(|entry| {
                    let name = entry.file_name().to_string_lossy().to_lowercase();
                    extensions.iter().any(|ext| name.ends_with(ext.as_str()))
                })
                .map(|entry| {
                    let path = entry.path().to_path_buf();
                    let mtime_ms = entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .map(|t| chrono::DateTime::<Utc>::from(t).timestamp_millis());
                    let logical_path = match &archive {
                        Some(archive) => archive_member_path(archive, &root, &path),
                        None => path.display().to_string(),
                    };
                    FoundFile {
                        path,
                        logical_path,
                        mtime_ms,
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ScanError::Task(e.to_string()))
    }

    async fn resolve_key(&self, unit: &Path, root: &Path, device_id: Option<&str>) -> Option<String> {
        let name = self.options.key_file_name.clone();
        let depth = self.options.recurse_depth;
        let root = root.to_path_buf();
        let above = unit.parent().map(Path::to_path_buf);

        let local = tokio::task::spawn_blocking(move || {
            find_key_downward(&root, &name, depth)
                .or_else(|| above.and_then(|dir| find_key_upward(&dir, &name, depth)))
        })
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Key search task failed");
            None
        });
        if local.is_some() {
            return local;
        }

        let (api, device_id) = (self.key_lookup.as_ref()?, device_id?);
        match api.lookup_key(device_id).await {
            Ok(Some(key)) => {
                tracing::info!(device_id, "Decrypt key filled in by server");
                Some(key)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "Key auto-fill failed");
                None
            }
        }
    }
}

#[async_trait]
impl UnitScan for Scanner {
    async fn scan_unit(&self, unit: &Path) -> Result<ScanSummary, ScanError> {
        let metadata = tokio::fs::metadata(unit)
            .await
            .map_err(|_| ScanError::NotFound(unit.to_path_buf()))?;

        let summary = if metadata.is_dir() {
            self.scan_directory(unit, unit, None).await?
        } else if is_archive_path(unit) {
            let lease = self.extractor.extract(unit).await?;
            let scratch = lease.path();
            let result = self.scan_directory(unit, scratch, Some(unit)).await;
            // Uploads read from the scratch dir; nothing queued means nothing will
            if !matches!(&result, Ok(s) if s.queued > 0) {
                if let Err(e) = tokio::fs::remove_dir_all(scratch).await {
                    tracing::debug!(path = %scratch.display(), error = %e, "Could not remove unused scratch dir");
                }
            }
            drop(lease);
            result?
        } else {
            return Err(ScanError::NotAUnit(unit.to_path_buf()));
        };

        tracing::info!(
            unit = %unit.display(),
            files = summary.files_seen,
            queued = summary.queued,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            "Unit scanned"
        );
        self.events.emit_lossy(AgentEvent::ScanCompleted {
            unit_path: unit.display().to_string(),
            files_seen: summary.files_seen,
            queued: summary.queued,
            duplicates: summary.duplicates,
            skipped: summary.skipped,
            timestamp: Utc::now(),
        });
        Ok(summary)
    }
}

/// `{archive}!/{inner/path}` with forward slashes
pub fn archive_member_path(archive: &Path, scratch_root: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(scratch_root).unwrap_or(file);
    let inner: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    format!("{}!/{}", archive.display(), inner.join("/"))
}

/// Keep one file per name; a copy outside a scratch dir wins over one inside
fn dedup_by_name(files: Vec<FoundFile>) -> (Vec<FoundFile>, usize) {
    let mut kept: Vec<FoundFile> = Vec::with_capacity(files.len());
    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut duplicates = 0;

    for file in files {
        let name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match by_name.get(&name) {
            Some(&idx) => {
                duplicates += 1;
                if is_scratch_path(&kept[idx].path) && !is_scratch_path(&file.path) {
                    kept[idx] = file;
                }
            }
            None => {
                by_name.insert(name, kept.len());
                kept.push(file);
            }
        }
    }
    (kept, duplicates)
}
