//! Content-addressed task store
//!
//! Persists upload tasks keyed by logical path and answers the dedup
//! questions the scanner, uploader and cleaner ask ("has this content ever
//! been uploaded?").
//!
//! **Backends:**
//! - SQLite (`data/upload_tasks.db`), the normal case. No connection is held
//!   between operations; each call opens, works, and closes.
//! - JSON file (`data/tasks.json`), used when SQLite cannot be opened at
//!   startup. Same semantics, slower queries.
//!
//! **Rules shared by both backends:**
//! - A row in `success` is never rewritten.
//! - `load()` turns every `uploading` row back into `pending` (a crash
//!   mid-batch must not strand tasks).

use crate::models::{TaskStatus, UploadTask};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use chrono::{DateTime, Utc};
use medlog_common::db::{init_task_database, open_connection};
use medlog_common::{Error, Result};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, Row};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Calculate the SHA-256 hex digest of a file.
///
/// Reads in 1 MB chunks on the blocking pool.
pub async fn compute_hash(file_path: &Path) -> Result<String> {
    let path_buf = file_path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<String> {
        use std::fs::File;
        use std::io::Read;

        let mut file = File::open(&path_buf)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| Error::Internal(format!("Hash calculation task failed: {}", e)))?
}

/// Hash a file, returning `None` (and logging) on any failure
pub async fn try_hash(file_path: &Path) -> Option<String> {
    match compute_hash(file_path).await {
        Ok(hash) => Some(hash),
        Err(e) => {
            tracing::warn!(path = %file_path.display(), error = %e, "Could not hash file");
            None
        }
    }
}

/// Storage backend selected at startup
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    Sqlite { db_path: PathBuf },
    Json { tasks_path: PathBuf },
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Sqlite { .. } => "sqlite",
            StoreBackend::Json { .. } => "json",
        }
    }
}

/// Persistent task store
#[derive(Clone)]
pub struct ContentStore {
    backend: Arc<StoreBackend>,
    /// Serializes read-modify-write cycles on the JSON file
    json_lock: Arc<Mutex<()>>,
    max_lock_wait_ms: u64,
}

impl ContentStore {
    /// Open the SQLite store, falling back to the JSON file if SQLite is
    /// unusable.
    pub async fn open(db_path: PathBuf, tasks_path: PathBuf) -> Self {
        match init_task_database(&db_path).await {
            Ok(()) => Self::with_backend(StoreBackend::Sqlite { db_path }),
            Err(e) => {
                tracing::warn!(
                    db = %db_path.display(),
                    fallback = %tasks_path.display(),
                    error = %e,
                    "SQLite task store unavailable, using JSON file"
                );
                Self::with_backend(StoreBackend::Json { tasks_path })
            }
        }
    }

    /// JSON-file store (no SQLite probe)
    pub fn json(tasks_path: PathBuf) -> Self {
        Self::with_backend(StoreBackend::Json { tasks_path })
    }

    fn with_backend(backend: StoreBackend) -> Self {
        Self {
            backend: Arc::new(backend),
            json_lock: Arc::new(Mutex::new(())),
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    /// Load every task, resetting `uploading` rows to `pending` first.
    pub async fn load(&self) -> Result<Vec<UploadTask>> {
        match self.backend.as_ref() {
            StoreBackend::Sqlite { db_path } => {
                let db_path = db_path.as_path();
                retry_on_lock("load tasks", self.max_lock_wait_ms, move || {
                    sqlite::load(db_path)
                })
                .await
            }
            StoreBackend::Json { tasks_path } => {
                let _guard = self.json_lock.lock().await;
                let mut tasks = json::read(tasks_path).await?;
                let mut reset = 0usize;
                for task in tasks.iter_mut() {
                    if task.status == TaskStatus::Uploading {
                        task.status = TaskStatus::Pending;
                        task.updated_at = Utc::now();
                        reset += 1;
                    }
                }
                if reset > 0 {
                    json::write(tasks_path, &tasks).await?;
                }
                Ok(tasks)
            }
        }
    }

    /// Upsert tasks by logical path. Rows already in `success` are kept.
    pub async fn save(&self, tasks: &[UploadTask]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        match self.backend.as_ref() {
            StoreBackend::Sqlite { db_path } => {
                let db_path = db_path.as_path();
                retry_on_lock("save tasks", self.max_lock_wait_ms, move || {
                    sqlite::save(db_path, tasks)
                })
                .await
            }
            StoreBackend::Json { tasks_path } => {
                let _guard = self.json_lock.lock().await;
                let mut stored = json::read(tasks_path).await?;
                let mut index: HashMap<String, usize> = stored
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (t.file_path.clone(), i))
                    .collect();

                for task in tasks {
                    match index.get(&task.file_path) {
                        Some(&i) => {
                            if stored[i].status != TaskStatus::Success {
                                let created_at = stored[i].created_at;
                                let previous_hash = stored[i].file_hash.clone();
                                stored[i] = task.clone();
                                stored[i].created_at = created_at;
                                if stored[i].file_hash.is_none() {
                                    stored[i].file_hash = previous_hash;
                                }
                            }
                        }
                        None => {
                            index.insert(task.file_path.clone(), stored.len());
                            stored.push(task.clone());
                        }
                    }
                }
                json::write(tasks_path, &stored).await
            }
        }
    }

    /// True when any row with this content hash reached `success`
    pub async fn has_succeeded_by_hash(&self, hash: &str) -> Result<bool> {
        match self.backend.as_ref() {
            StoreBackend::Sqlite { db_path } => {
                let db_path = db_path.as_path();
                retry_on_lock("success by hash", self.max_lock_wait_ms, move || {
                    sqlite::exists(
                        db_path,
                        "SELECT 1 FROM upload_tasks WHERE file_hash = ? AND status = 'success' LIMIT 1",
                        hash,
                    )
                })
                .await
            }
            StoreBackend::Json { tasks_path } => {
                let tasks = self.read_json(tasks_path).await?;
                Ok(tasks.iter().any(|t| {
                    t.status == TaskStatus::Success && t.file_hash.as_deref() == Some(hash)
                }))
            }
        }
    }

    /// True when the row for this logical path reached `success`
    pub async fn has_succeeded_by_path(&self, file_path: &str) -> Result<bool> {
        match self.backend.as_ref() {
            StoreBackend::Sqlite { db_path } => {
                let db_path = db_path.as_path();
                retry_on_lock("success by path", self.max_lock_wait_ms, move || {
                    sqlite::exists(
                        db_path,
                        "SELECT 1 FROM upload_tasks WHERE file_path = ? AND status = 'success' LIMIT 1",
                        file_path,
                    )
                })
                .await
            }
            StoreBackend::Json { tasks_path } => {
                let tasks = self.read_json(tasks_path).await?;
                Ok(tasks
                    .iter()
                    .any(|t| t.status == TaskStatus::Success && t.file_path == file_path))
            }
        }
    }

    /// All content hashes with a successful upload
    pub async fn successful_hashes(&self) -> Result<HashSet<String>> {
        self.hashes_with_status(TaskStatus::Success).await
    }

    /// All content hashes whose row is currently `failed`
    pub async fn failed_hashes(&self) -> Result<HashSet<String>> {
        self.hashes_with_status(TaskStatus::Failed).await
    }

    async fn hashes_with_status(&self, status: TaskStatus) -> Result<HashSet<String>> {
        match self.backend.as_ref() {
            StoreBackend::Sqlite { db_path } => {
                let db_path = db_path.as_path();
                retry_on_lock("hashes by status", self.max_lock_wait_ms, move || {
                    sqlite::hashes_with_status(db_path, status)
                })
                .await
            }
            StoreBackend::Json { tasks_path } => {
                let tasks = self.read_json(tasks_path).await?;
                Ok(tasks
                    .into_iter()
                    .filter(|t| t.status == status)
                    .filter_map(|t| t.file_hash)
                    .collect())
            }
        }
    }

    /// Effective status of a logical path.
    ///
    /// A path whose own row is unfinished (or missing) still counts as
    /// `success` when identical content succeeded under another path.
    pub async fn resolve_status(
        &self,
        file_path: &str,
        file_hash: Option<&str>,
    ) -> Result<Option<TaskStatus>> {
        let own = match self.backend.as_ref() {
            StoreBackend::Sqlite { db_path } => {
                let db_path = db_path.as_path();
                retry_on_lock("status by path", self.max_lock_wait_ms, move || {
                    sqlite::status_by_path(db_path, file_path)
                })
                .await?
            }
            StoreBackend::Json { tasks_path } => self
                .read_json(tasks_path)
                .await?
                .into_iter()
                .find(|t| t.file_path == file_path)
                .map(|t| t.status),
        };

        if own == Some(TaskStatus::Success) {
            return Ok(own);
        }
        if let Some(hash) = file_hash {
            if self.has_succeeded_by_hash(hash).await? {
                return Ok(Some(TaskStatus::Success));
            }
        }
        Ok(own)
    }

    /// Row counts per status
    pub async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>> {
        match self.backend.as_ref() {
            StoreBackend::Sqlite { db_path } => {
                let db_path = db_path.as_path();
                retry_on_lock("count by status", self.max_lock_wait_ms, move || {
                    sqlite::count_by_status(db_path)
                })
                .await
            }
            StoreBackend::Json { tasks_path } => {
                let mut counts = HashMap::new();
                for task in self.read_json(tasks_path).await? {
                    *counts.entry(task.status).or_insert(0) += 1;
                }
                Ok(counts)
            }
        }
    }

    async fn read_json(&self, tasks_path: &Path) -> Result<Vec<UploadTask>> {
        let _guard = self.json_lock.lock().await;
        json::read(tasks_path).await
    }
}

mod sqlite {
    use super::*;
    use sqlx::sqlite::SqliteConnection;

    async fn connect(db_path: &Path) -> Result<SqliteConnection> {
        open_connection(db_path).await
    }

    pub(super) async fn load(db_path: &Path) -> Result<Vec<UploadTask>> {
        let mut conn = connect(db_path).await?;

        let reset = sqlx::query(
            "UPDATE upload_tasks SET status = 'pending', updated_at = ? WHERE status = 'uploading'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&mut conn)
        .await?
        .rows_affected();
        if reset > 0 {
            tracing::info!(reset, "Reset interrupted uploads to pending");
        }

        let rows = sqlx::query(
            r#"
            SELECT id, device_id, file_path, upload_path, decrypt_key, file_hash, status,
                   retry_count, last_error, created_at, updated_at
            FROM upload_tasks
            ORDER BY created_at
            "#,
        )
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        rows.iter().map(task_from_row).collect()
    }

    pub(super) async fn save(db_path: &Path, tasks: &[UploadTask]) -> Result<()> {
        let mut conn = connect(db_path).await?;
        let mut tx = conn.begin().await?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO upload_tasks (
                    id, device_id, file_path, upload_path, decrypt_key, file_hash, status,
                    retry_count, last_error, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(file_path) DO UPDATE SET
                    device_id = excluded.device_id,
                    upload_path = excluded.upload_path,
                    decrypt_key = excluded.decrypt_key,
                    file_hash = COALESCE(excluded.file_hash, upload_tasks.file_hash),
                    status = excluded.status,
                    retry_count = excluded.retry_count,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at
                WHERE upload_tasks.status != 'success'
                "#,
            )
            .bind(task.id.to_string())
            .bind(&task.device_id)
            .bind(&task.file_path)
            .bind(task.upload_path.to_string_lossy().to_string())
            .bind(&task.decrypt_key)
            .bind(task.file_hash.as_deref())
            .bind(task.status.as_str())
            .bind(task.retry_count as i64)
            .bind(task.last_error.as_deref())
            .bind(task.created_at.to_rfc3339())
            .bind(task.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        conn.close().await?;
        Ok(())
    }

    pub(super) async fn exists(db_path: &Path, sql: &str, value: &str) -> Result<bool> {
        let mut conn = connect(db_path).await?;
        let found: Option<i64> = sqlx::query_scalar(sql)
            .bind(value)
            .fetch_optional(&mut conn)
            .await?;
        conn.close().await?;
        Ok(found.is_some())
    }

    pub(super) async fn hashes_with_status(
        db_path: &Path,
        status: TaskStatus,
    ) -> Result<HashSet<String>> {
        let mut conn = connect(db_path).await?;
        let hashes: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT file_hash FROM upload_tasks WHERE status = ? AND file_hash IS NOT NULL",
        )
        .bind(status.as_str())
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;
        Ok(hashes.into_iter().collect())
    }

    pub(super) async fn status_by_path(
        db_path: &Path,
        file_path: &str,
    ) -> Result<Option<TaskStatus>> {
        let mut conn = connect(db_path).await?;
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM upload_tasks WHERE file_path = ?")
                .bind(file_path)
                .fetch_optional(&mut conn)
                .await?;
        conn.close().await?;
        Ok(status.as_deref().and_then(TaskStatus::parse))
    }

    pub(super) async fn count_by_status(db_path: &Path) -> Result<HashMap<TaskStatus, u64>> {
        let mut conn = connect(db_path).await?;
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM upload_tasks GROUP BY status")
                .fetch_all(&mut conn)
                .await?;
        conn.close().await?;

        Ok(rows
            .into_iter()
            .filter_map(|(status, count)| {
                TaskStatus::parse(&status).map(|s| (s, count.max(0) as u64))
            })
            .collect())
    }

    fn parse_timestamp(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    fn task_from_row(row: &SqliteRow) -> Result<UploadTask> {
        let id: String = row.try_get("id")?;
        let file_path: String = row.try_get("file_path")?;
        let upload_path: Option<String> = row.try_get("upload_path")?;
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        let retry_count: i64 = row.try_get("retry_count")?;

        Ok(UploadTask {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::new_v4()),
            device_id: row.try_get("device_id")?,
            decrypt_key: row
                .try_get::<Option<String>, _>("decrypt_key")?
                .unwrap_or_default(),
            upload_path: PathBuf::from(upload_path.unwrap_or_else(|| file_path.clone())),
            file_path,
            file_hash: row.try_get("file_hash")?,
            status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
            retry_count: retry_count.max(0) as u32,
            last_error: row.try_get("last_error")?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
            mtime_ms: None,
            counted_failed: false,
        })
    }
}

mod json {
    use super::*;

    pub(super) async fn read(tasks_path: &Path) -> Result<Vec<UploadTask>> {
        match tokio::fs::read(tasks_path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via temp file + rename so a crash never leaves a torn file
    pub(super) async fn write(tasks_path: &Path, tasks: &[UploadTask]) -> Result<()> {
        if let Some(parent) = tasks_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(tasks)?;
        let tmp = tasks_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, tasks_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileCandidate;
    use tempfile::TempDir;

    fn task(path: &str, hash: Option<&str>) -> UploadTask {
        UploadTask::from_candidate(FileCandidate {
            device_id: "4371-04".to_string(),
            decrypt_key: "aa:bb:cc:dd:ee:ff".to_string(),
            file_hash: hash.map(str::to_string),
            file_path: path.to_string(),
            upload_path: PathBuf::from(path),
            mtime_ms: Some(1),
        })
    }

    async fn sqlite_store(dir: &TempDir) -> ContentStore {
        let store = ContentStore::open(
            dir.path().join("data/upload_tasks.db"),
            dir.path().join("data/tasks.json"),
        )
        .await;
        assert!(matches!(store.backend(), StoreBackend::Sqlite { .. }));
        store
    }

    #[tokio::test]
    async fn test_compute_hash_matches_sha256() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.medbot");
        std::fs::write(&path, b"test content").unwrap();

        let hash = compute_hash(&path).await.unwrap();
        assert_eq!(hash, format!("{:x}", Sha256::digest(b"test content")));
    }

    #[tokio::test]
    async fn test_hash_failure_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(try_hash(&dir.path().join("missing")).await.is_none());
    }

    #[tokio::test]
    async fn test_success_rows_are_never_regressed() {
        let dir = TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;

        let mut t = task("/a/1.medbot", Some("h1"));
        t.status = TaskStatus::Success;
        store.save(&[t.clone()]).await.unwrap();

        let mut regress = t.clone();
        regress.status = TaskStatus::Failed;
        regress.last_error = Some("boom".to_string());
        store.save(&[regress]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, TaskStatus::Success);
        assert_eq!(loaded[0].last_error, None);
    }

    #[tokio::test]
    async fn test_load_resets_uploading_to_pending() {
        let dir = TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;

        let mut t = task("/a/1.medbot", Some("h1"));
        t.status = TaskStatus::Uploading;
        store.save(&[t]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].status, TaskStatus::Pending);
        assert_eq!(loaded[0].decrypt_key, "aa:bb:cc:dd:ee:ff");

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Uploading), None);
    }

    #[tokio::test]
    async fn test_hash_and_path_queries() {
        let dir = TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;

        let mut ok = task("/a/ok.medbot", Some("good"));
        ok.status = TaskStatus::Success;
        let mut bad = task("/a/bad.medbot", Some("bad"));
        bad.status = TaskStatus::Failed;
        store.save(&[ok, bad]).await.unwrap();

        assert!(store.has_succeeded_by_hash("good").await.unwrap());
        assert!(!store.has_succeeded_by_hash("bad").await.unwrap());
        assert!(store.has_succeeded_by_path("/a/ok.medbot").await.unwrap());
        assert!(!store.has_succeeded_by_path("/a/bad.medbot").await.unwrap());
        assert_eq!(
            store.successful_hashes().await.unwrap(),
            HashSet::from(["good".to_string()])
        );
        assert_eq!(
            store.failed_hashes().await.unwrap(),
            HashSet::from(["bad".to_string()])
        );
    }

    #[tokio::test]
    async fn test_resolve_status_follows_content_hash() {
        let dir = TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;

        let mut first = task("/a/one.zip!/1700000000_log.medbot", Some("same"));
        first.status = TaskStatus::Success;
        store.save(&[first]).await.unwrap();

        let status = store
            .resolve_status("/a/two.zip!/1700000000_log.medbot", Some("same"))
            .await
            .unwrap();
        assert_eq!(status, Some(TaskStatus::Success));
        assert_eq!(
            store.resolve_status("/a/unknown", None).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_missing_hash_does_not_erase_stored_hash() {
        let dir = TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;

        store.save(&[task("/a/1.medbot", Some("h1"))]).await.unwrap();
        store.save(&[task("/a/1.medbot", None)]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].file_hash.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn test_falls_back_to_json_when_sqlite_unusable() {
        let dir = TempDir::new().unwrap();
        // A directory where the database file should be makes SQLite fail
        let db_path = dir.path().join("data/upload_tasks.db");
        std::fs::create_dir_all(&db_path).unwrap();

        let store = ContentStore::open(db_path, dir.path().join("data/tasks.json")).await;
        assert!(matches!(store.backend(), StoreBackend::Json { .. }));

        let mut t = task("/a/1.medbot", Some("h1"));
        t.status = TaskStatus::Uploading;
        store.save(&[t]).await.unwrap();
        assert!(dir.path().join("data/tasks.json").exists());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_json_backend_keeps_success_terminal() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::json(dir.path().join("tasks.json"));

        let mut t = task("/a/1.medbot", Some("h1"));
        t.status = TaskStatus::Success;
        store.save(&[t.clone()]).await.unwrap();
        t.status = TaskStatus::Pending;
        store.save(&[t, task("/a/2.medbot", Some("h2"))]).await.unwrap();

        assert!(store.has_succeeded_by_hash("h1").await.unwrap());
        assert!(store.has_succeeded_by_path("/a/1.medbot").await.unwrap());
        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&TaskStatus::Success), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&1));
    }
}
