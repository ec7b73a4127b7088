//! Archive extraction into scratch directories
//!
//! `.zip` archives are unpacked in-process with the `zip` crate (entry
//! names are sanitized against path traversal). `.7z` archives are handed to
//! an external 7-Zip executable (`7z x <archive> -o<dir> -y`; `7za` is
//! tried when `7z` is not installed and no path is configured).
//!
//! Every extraction gets a fresh directory
//! `<data_dir>/temp/extract_<millis>_<random>`. Uploads read from scratch
//! directories after the scan, so the cleaner deletes them once their
//! content is safely uploaded. A failed extraction removes its partial
//! directory immediately.
//!
//! While a scan reads a scratch directory it holds a [`ScratchLease`] on it;
//! the cleaner never touches a leased directory.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Prefix of scratch directory names
pub const SCRATCH_PREFIX: &str = "extract_";

/// 7-Zip is killed after this long
pub const DEFAULT_EXTRACT_TIMEOUT: Duration = Duration::from_secs(300);

static SCRATCH_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[/\\])temp[/\\]extract_").expect("scratch path pattern is valid")
});

/// Archive extraction errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Zip extraction failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("7-Zip exited with {code:?}: {stderr}")]
    SevenZip { code: Option<i32>, stderr: String },

    #[error("7-Zip timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Extraction task failed: {0}")]
    Task(String),
}

/// True when `path` lies inside a scratch extraction directory
pub fn is_scratch_path(path: &Path) -> bool {
    SCRATCH_PATH_RE.is_match(&path.to_string_lossy())
}

/// Scratch directories currently being read by a scan
#[derive(Debug, Clone, Default)]
pub struct ScratchLeases {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ScratchLeases {
    fn acquire(&self, dir: PathBuf) -> ScratchLease {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dir.clone());
        ScratchLease {
            dir,
            leases: self.clone(),
        }
    }

    pub fn is_held(&self, dir: &Path) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(dir)
    }
}

/// An extracted scratch directory; released when dropped
#[derive(Debug)]
pub struct ScratchLease {
    dir: PathBuf,
    leases: ScratchLeases,
}

impl ScratchLease {
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for ScratchLease {
    fn drop(&mut self) {
        self.leases
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.dir);
    }
}

/// Extracts archives into scratch directories below `temp_root`
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    temp_root: PathBuf,
    /// Configured 7-Zip path; `None` searches `PATH` for `7z`, then `7za`
    seven_zip: Option<PathBuf>,
    timeout: Duration,
    leases: ScratchLeases,
}

impl ArchiveExtractor {
    pub fn new(temp_root: PathBuf, seven_zip: Option<PathBuf>) -> Self {
        Self {
            temp_root,
            seven_zip,
            timeout: DEFAULT_EXTRACT_TIMEOUT,
            leases: ScratchLeases::default(),
        }
    }

    /// Share lease bookkeeping with the cleaner
    pub fn with_leases(mut self, leases: ScratchLeases) -> Self {
        self.leases = leases;
        self
    }

    /// Fresh, not yet existing scratch directory path
    fn scratch_dir(&self) -> PathBuf {
        let millis = chrono::Utc::now().timestamp_millis();
        let random = uuid::Uuid::new_v4().simple().to_string();
        self.temp_root
            .join(format!("{}{}_{}", SCRATCH_PREFIX, millis, &random[..8]))
    }

    /// Extract `archive` and return the leased scratch directory holding its
    /// content.
    pub async fn extract(&self, archive: &Path) -> Result<ScratchLease, ArchiveError> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let lease = self.leases.acquire(self.scratch_dir());
        let target = lease.path().to_path_buf();
        tokio::fs::create_dir_all(&target).await?;

        let result = if name.ends_with(".zip") {
            extract_zip(archive, &target).await
        } else if name.ends_with(".7z") {
            self.extract_7z(archive, &target).await
        } else {
            Err(ArchiveError::UnsupportedFormat(archive.display().to_string()))
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    archive = %archive.display(),
                    target = %target.display(),
                    "Archive extracted"
                );
                Ok(lease)
            }
            Err(e) => {
                if let Err(rm_err) = tokio::fs::remove_dir_all(&target).await {
                    tracing::debug!(path = %target.display(), error = %rm_err, "Could not remove partial scratch dir");
                }
                Err(e)
            }
        }
    }

    async fn extract_7z(&self, archive: &Path, target: &Path) -> Result<(), ArchiveError> {
        let candidates: Vec<PathBuf> = match &self.seven_zip {
            Some(tool) => vec![tool.clone()],
            None => vec![PathBuf::from("7z"), PathBuf::from("7za")],
        };

        let mut last_err = None;
        for tool in &candidates {
            match self.run_7z(tool, archive, target).await {
                Err(ArchiveError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(tool = %tool.display(), "7-Zip executable not found");
                    last_err = Some(ArchiveError::Io(e));
                }
                other => return other,
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no 7-Zip executable",
            ))
        }))
    }

    async fn run_7z(&self, tool: &Path, archive: &Path, target: &Path) -> Result<(), ArchiveError> {
        tracing::debug!(
            tool = %tool.display(),
            archive = %archive.display(),
            "Running 7-Zip"
        );

        let mut command = tokio::process::Command::new(tool);
        command
            .arg("x")
            .arg(archive)
            .arg(format!("-o{}", target.display()))
            .arg("-y")
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ArchiveError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(ArchiveError::SevenZip {
                code: output.status.code(),
                stderr: detail.chars().take(500).collect(),
            });
        }
        Ok(())
    }
}

async fn extract_zip(archive: &Path, target: &Path) -> Result<(), ArchiveError> {
    let archive = archive.to_path_buf();
    let target = target.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<(), ArchiveError> {
        let file = std::fs::File::open(&archive)?;
        let mut zip = zip::ZipArchive::new(file)?;
        zip.extract(&target)?;
        Ok(())
    })
    .await
    .map_err(|e| ArchiveError::Task(e.to_string()))?
}
