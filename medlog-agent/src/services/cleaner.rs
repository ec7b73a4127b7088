//! Scratch directory cleanup
//!
//! Extraction scratch directories (`temp/extract_*`) are deleted once their
//! content is accounted for. A directory is kept when:
//! - any live task is still pending or uploading
//! - a scan is still reading it
//! - it holds the source of a task not yet uploaded (failed ones included)
//! - any strictly named payload file (`^\d{10}_log\.<ext>$`) cannot be
//!   hashed, or its hash has no recorded success
//!
//! Payload files with other names never block deletion. A directory with no
//! strictly named files is deleted.

use crate::services::archive::{ScratchLeases, SCRATCH_PREFIX};
use crate::services::content_store::{try_hash, ContentStore};
use crate::services::uploader::{UploadActivity, UploaderHandle};
use async_trait::async_trait;
use chrono::Utc;
use medlog_common::events::{AgentEvent, EventBus};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Reports the uploader's live state; `None` when it cannot be asked
#[async_trait]
pub trait ActivityProbe: Send + Sync {
    async fn upload_activity(&self) -> Option<UploadActivity>;
}

#[async_trait]
impl ActivityProbe for UploaderHandle {
    async fn upload_activity(&self) -> Option<UploadActivity> {
        self.activity().await.ok()
    }
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
}

/// Strict payload name for `extension` (`.medbot` → `^\d{10}_log\.medbot$`)
pub fn strict_name_pattern(extension: &str) -> Regex {
    let ext = extension.trim_start_matches('.');
    Regex::new(&format!(r"(?i)^\d{{10}}_log\.{}$", regex::escape(ext)))
        .expect("escaped extension pattern is valid")
}

pub struct Cleaner {
    temp_root: PathBuf,
    strict_name: Regex,
    store: ContentStore,
    activity: Arc<dyn ActivityProbe>,
    leases: ScratchLeases,
    events: EventBus,
}

impl Cleaner {
    pub fn new(
        temp_root: PathBuf,
        payload_extension: &str,
        store: ContentStore,
        activity: Arc<dyn ActivityProbe>,
        leases: ScratchLeases,
        events: EventBus,
    ) -> Self {
        Self {
            temp_root,
            strict_name: strict_name_pattern(payload_extension),
            store,
            activity,
            leases,
            events,
        }
    }

    /// One pass over all scratch directories
    pub async fn sweep(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let dirs = scratch_dirs(&self.temp_root).await;
        if dirs.is_empty() {
            return report;
        }

        let activity = match self.activity.upload_activity().await {
            Some(activity) if !activity.active => activity,
            Some(_) => {
                tracing::debug!(dirs = dirs.len(), "Uploads in progress, scratch dirs kept");
                report.kept = dirs;
                return report;
            }
            None => {
                tracing::debug!(dirs = dirs.len(), "Uploader unreachable, scratch dirs kept");
                report.kept = dirs;
                return report;
            }
        };

        let hashes = tokio::try_join!(self.store.successful_hashes(), self.store.failed_hashes());
        let (succeeded, failed) = match hashes {
            Ok(hashes) => hashes,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read upload hashes, cleanup skipped");
                report.kept = dirs;
                return report;
            }
        };

        for dir in dirs {
            if self.leases.is_held(&dir) {
                tracing::debug!(dir = %dir.display(), "Scratch dir in use by a scan");
                report.kept.push(dir);
                continue;
            }
            if activity.unfinished.iter().any(|source| source.starts_with(&dir)) {
                tracing::debug!(dir = %dir.display(), "Scratch dir holds a source still to upload");
                report.kept.push(dir);
                continue;
            }
            if self.is_accounted_for(&dir, &succeeded, &failed).await {
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {
                        tracing::info!(path = %dir.display(), "Scratch dir removed");
                        self.events.emit_lossy(AgentEvent::ScratchDirRemoved {
                            path: dir.display().to_string(),
                            timestamp: Utc::now(),
                        });
                        report.deleted.push(dir);
                    }
                    Err(e) => {
                        tracing::warn!(path = %dir.display(), error = %e, "Could not remove scratch dir");
                        report.kept.push(dir);
                    }
                }
            } else {
                report.kept.push(dir);
            }
        }
        report
    }

    /// Every strictly named file has a successful hash
    async fn is_accounted_for(
        &self,
        dir: &Path,
        succeeded: &HashSet<String>,
        failed: &HashSet<String>,
    ) -> bool {
        for file in strict_files(dir, &self.strict_name).await {
            let hash = try_hash(&file).await;
            let reason = match hash.as_deref() {
                Some(hash) if succeeded.contains(hash) => continue,
                Some(hash) if failed.contains(hash) => "upload failed",
                Some(_) => "not yet uploaded",
                None => "unreadable",
            };
            tracing::debug!(
                dir = %dir.display(),
                file = %file.display(),
                reason,
                "Scratch dir kept"
            );
            return false;
        }
        true
    }
}

/// `extract_*` directories directly below `temp_root`
async fn scratch_dirs(temp_root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut entries = match tokio::fs::read_dir(temp_root).await {
        Ok(entries) => entries,
        Err(_) => return dirs,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if is_dir && entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    dirs
}

/// Strictly named files anywhere below `dir` (iterative walk)
async fn strict_files(dir: &Path, strict_name: &Regex) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if strict_name.is_match(&entry.file_name().to_string_lossy()) {
                files.push(entry.path());
            }
        }
    }
    files
}

/// Run `cleaner` now and then every `interval` until cancelled
pub fn spawn_cleaner(cleaner: Cleaner, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_mins = interval.as_secs() / 60, "Scratch cleanup scheduled");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    let report = cleaner.sweep().await;
                    if !report.deleted.is_empty() || !report.kept.is_empty() {
                        tracing::info!(
                            deleted = report.deleted.len(),
                            kept = report.kept.len(),
                            "Scratch cleanup finished"
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileCandidate, TaskStatus, UploadTask};
    use crate::services::content_store::compute_hash;
    use crate::services::archive::ArchiveExtractor;
    use std::fs;
    use tempfile::TempDir;

    struct Probe(UploadActivity);

    #[async_trait]
    impl ActivityProbe for Probe {
        async fn upload_activity(&self) -> Option<UploadActivity> {
            Some(self.0.clone())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ActivityProbe for Unreachable {
        async fn upload_activity(&self) -> Option<UploadActivity> {
            None
        }
    }

    fn cleaner_with(dir: &TempDir, store: ContentStore, probe: Arc<dyn ActivityProbe>) -> Cleaner {
        Cleaner::new(
            dir.path().join("temp"),
            ".medbot",
            store,
            probe,
            ScratchLeases::default(),
            EventBus::new(16),
        )
    }

    fn cleaner(dir: &TempDir, store: ContentStore, active: bool) -> Cleaner {
        let activity = UploadActivity {
            active,
            unfinished: Vec::new(),
        };
        cleaner_with(dir, store, Arc::new(Probe(activity)))
    }

    async fn record_success(store: &ContentStore, path: &Path) {
        let mut task = UploadTask::from_candidate(FileCandidate {
            device_id: "4371-04".to_string(),
            decrypt_key: "k".to_string(),
            file_hash: Some(compute_hash(path).await.unwrap()),
            file_path: path.display().to_string(),
            upload_path: path.to_path_buf(),
            mtime_ms: None,
        });
        task.status = TaskStatus::Success;
        store.save(&[task]).await.unwrap();
    }

    #[test]
    fn test_strict_name_pattern() {
        let re = strict_name_pattern(".medbot");
        assert!(re.is_match("1700000000_log.medbot"));
        assert!(re.is_match("1700000000_LOG.MEDBOT"));
        assert!(!re.is_match("170000000_log.medbot"));
        assert!(!re.is_match("1700000000_log.medbot.bak"));
        assert!(!re.is_match("x1700000000_log.medbot"));
    }

    #[tokio::test]
    async fn test_non_standard_names_only_is_deleted() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("temp/extract_1_aa");
        fs::create_dir_all(scratch.join("nested")).unwrap();
        fs::write(scratch.join("nested/other.medbot"), b"x").unwrap();
        fs::write(scratch.join("systemInfo.txt"), b"aa:bb:cc:dd:ee:ff").unwrap();

        let store = ContentStore::json(dir.path().join("tasks.json"));
        let report = cleaner(&dir, store, false).sweep().await;

        assert_eq!(report.deleted, vec![scratch.clone()]);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_one_unuploaded_file_keeps_directory() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("temp/extract_2_bb");
        fs::create_dir_all(&scratch).unwrap();
        let done = scratch.join("1700000000_log.medbot");
        fs::write(&done, b"uploaded").unwrap();
        fs::write(scratch.join("1700000001_log.medbot"), b"not yet").unwrap();

        let store = ContentStore::json(dir.path().join("tasks.json"));
        record_success(&store, &done).await;

        let report = cleaner(&dir, store, false).sweep().await;
        assert_eq!(report.kept, vec![scratch.clone()]);
        assert!(scratch.exists());
    }

    #[tokio::test]
    async fn test_all_uploaded_is_deleted_unless_uploads_active() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("temp/extract_3_cc");
        fs::create_dir_all(&scratch).unwrap();
        let file = scratch.join("1700000000_log.medbot");
        fs::write(&file, b"uploaded").unwrap();
        fs::create_dir_all(dir.path().join("temp/unrelated")).unwrap();

        let store = ContentStore::json(dir.path().join("tasks.json"));
        record_success(&store, &file).await;

        let busy = cleaner(&dir, store.clone(), true).sweep().await;
        assert!(busy.deleted.is_empty());
        assert!(scratch.exists());

        let idle = cleaner(&dir, store, false).sweep().await;
        assert_eq!(idle.deleted, vec![scratch.clone()]);
        assert!(dir.path().join("temp/unrelated").exists());
    }

    #[tokio::test]
    async fn test_source_of_failed_task_keeps_directory() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("temp/extract_1_aa");
        fs::create_dir_all(&scratch).unwrap();
        let source = scratch.join("export.medbot");
        fs::write(&source, b"retry me").unwrap();

        let store = ContentStore::json(dir.path().join("tasks.json"));
        let activity = UploadActivity {
            active: false,
            unfinished: vec![source.clone()],
        };
        let report = cleaner_with(&dir, store, Arc::new(Probe(activity)))
            .sweep()
            .await;

        assert_eq!(report.kept, vec![scratch]);
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_unreachable_uploader_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("temp/extract_4_dd");
        fs::create_dir_all(&scratch).unwrap();

        let store = ContentStore::json(dir.path().join("tasks.json"));
        let report = cleaner_with(&dir, store, Arc::new(Unreachable)).sweep().await;

        assert_eq!(report.kept, vec![scratch.clone()]);
        assert!(scratch.exists());
    }

    #[tokio::test]
    async fn test_directory_leased_by_scan_is_kept() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("4371-04.zip");
        {
            let file = fs::File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("export.medbot", zip::write::SimpleFileOptions::default())
                .unwrap();
            std::io::Write::write_all(&mut writer, b"payload").unwrap();
            writer.finish().unwrap();
        }

        let leases = ScratchLeases::default();
        let extractor =
            ArchiveExtractor::new(dir.path().join("temp"), None).with_leases(leases.clone());
        let lease = extractor.extract(&archive).await.unwrap();
        let scratch = lease.path().to_path_buf();

        let store = ContentStore::json(dir.path().join("tasks.json"));
        let cleaner = Cleaner::new(
            dir.path().join("temp"),
            ".medbot",
            store,
            Arc::new(Probe(UploadActivity::default())),
            leases,
            EventBus::new(16),
        );

        let during_scan = cleaner.sweep().await;
        assert_eq!(during_scan.kept, vec![scratch.clone()]);
        assert!(scratch.join("export.medbot").exists());

        drop(lease);
        let after_scan = cleaner.sweep().await;
        assert_eq!(after_scan.deleted, vec![scratch.clone()]);
    }

    #[tokio::test]
    async fn test_failed_hash_keeps_directory() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("temp/extract_5_ee");
        fs::create_dir_all(&scratch).unwrap();
        let file = scratch.join("1700000000_log.medbot");
        fs::write(&file, b"rejected").unwrap();

        let store = ContentStore::json(dir.path().join("tasks.json"));
        let mut task = UploadTask::from_candidate(FileCandidate {
            device_id: "4371-04".to_string(),
            decrypt_key: "k".to_string(),
            file_hash: Some(compute_hash(&file).await.unwrap()),
            file_path: "/a/4371-04.zip!/1700000000_log.medbot".to_string(),
            upload_path: file.clone(),
            mtime_ms: None,
        });
        task.status = TaskStatus::Failed;
        store.save(&[task]).await.unwrap();

        let report = cleaner(&dir, store, false).sweep().await;
        assert_eq!(report.kept, vec![scratch]);
    }
}
