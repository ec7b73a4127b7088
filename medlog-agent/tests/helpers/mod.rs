//! Test helpers shared by the medlog-agent integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use medlog_agent::services::ingest_client::{IngestApi, IngestError, UploadBatch};
use medlog_common::config::AgentConfig;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One upload call seen by [`FakeIngest`]
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub device_id: String,
    pub decrypt_key: String,
    pub file_names: Vec<String>,
    pub at: Instant,
}

/// In-memory ingestion backend
#[derive(Default)]
pub struct FakeIngest {
    uploads: Mutex<Vec<RecordedUpload>>,
    /// Remaining calls answered with a 500
    failures: Mutex<usize>,
    keys: Mutex<HashMap<String, String>>,
}

impl FakeIngest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: usize) -> Self {
        let fake = Self::default();
        *fake.failures.lock().unwrap() = times;
        fake
    }

    pub fn with_key(self, device_id: &str, key: &str) -> Self {
        self.keys
            .lock()
            .unwrap()
            .insert(device_id.to_string(), key.to_string());
        self
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl IngestApi for FakeIngest {
    async fn upload_batch(&self, batch: &UploadBatch) -> Result<(), IngestError> {
        self.uploads.lock().unwrap().push(RecordedUpload {
            device_id: batch.device_id.clone(),
            decrypt_key: batch.decrypt_key.clone(),
            file_names: batch.files.iter().map(|f| f.file_name.clone()).collect(),
            at: Instant::now(),
        });

        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(IngestError::Server {
                status: 500,
                message: "simulated outage".to_string(),
            });
        }
        Ok(())
    }

    async fn lookup_key(&self, device_id: &str) -> Result<Option<String>, IngestError> {
        Ok(self.keys.lock().unwrap().get(device_id).cloned())
    }
}

/// Agent config rooted in `dir`: data in `dir/data`, watching `dir/watch`
pub fn test_config(dir: &Path) -> AgentConfig {
    let watch = dir.join("watch");
    std::fs::create_dir_all(&watch).unwrap();

    let mut config = AgentConfig {
        data_dir: Some(dir.join("data")),
        watch_paths: vec![watch],
        status_listen: String::new(),
        concurrency: 1,
        periodic_rescan_interval: 0,
        auto_login: false,
        ..AgentConfig::default()
    };
    config.logging.file = false;
    config.normalize();
    config
}

/// Write a zip archive with the given entries
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}

/// Device directory with a key descriptor and the given payload files
pub fn write_unit(root: &Path, device_id: &str, key: Option<&str>, files: &[(&str, &[u8])]) -> PathBuf {
    let unit = root.join(device_id);
    std::fs::create_dir_all(&unit).unwrap();
    if let Some(key) = key {
        std::fs::write(unit.join("systemInfo.txt"), format!("MAC: {}\r\n", key)).unwrap();
    }
    for (name, data) in files {
        let path = unit.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }
    unit
}

/// Poll `check` until it returns true or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
