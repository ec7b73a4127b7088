//! Agent configuration
//!
//! Configuration lives in a single TOML file. The file path is resolved in
//! priority order:
//! 1. Command-line argument (`--config`)
//! 2. `MEDLOG_CONFIG` environment variable
//! 3. Platform config directory (`<config_dir>/medlog/agent.toml`)
//!
//! A missing file is not an error: defaults (with a freshly generated
//! client id) are written to the resolved path and startup continues.
//! Every loaded or written config passes through [`AgentConfig::normalize`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "MEDLOG_CONFIG";

/// Payload extension that is always monitored
pub const PAYLOAD_EXTENSION: &str = ".medbot";

/// Default name of the key descriptor file
pub const DEFAULT_KEY_FILE_NAME: &str = "systemInfo.txt";

pub const MAX_WATCH_PATHS: usize = 10;
pub const MAX_CONCURRENCY: u32 = 5;
pub const MAX_RECURSE_DEPTH: u32 = 5;
pub const MAX_CLEANUP_INTERVAL_MINUTES: u64 = 1440;

/// Logging section of the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
    /// Also append log lines to `<data_dir>/logs/client.log`
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
        }
    }
}

/// Full agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the ingestion API, e.g. `http://host:3000/api`
    pub api_base_url: String,
    /// Stable identifier of this agent installation
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// Last bearer token obtained from the login endpoint
    pub token: String,
    /// Log in automatically with the stored credentials
    pub auto_login: bool,
    /// Concurrent upload batches; 0 pauses uploading
    pub concurrency: u32,
    pub watch_paths: Vec<PathBuf>,
    /// Directory levels below a watch root that are considered
    pub recurse_depth: u32,
    /// Monitored payload extensions (lowercase, leading dot)
    pub include_extensions: Vec<String>,
    pub key_file_name: String,
    /// When true only content appearing after startup is uploaded
    pub ignore_initial: bool,
    /// Minutes between periodic sweeps; 0 disables them
    pub periodic_rescan_interval: u64,
    /// Minutes between scratch directory cleanups
    pub temp_cleanup_interval: u64,
    /// Override for the agent data directory
    pub data_dir: Option<PathBuf>,
    /// Path to the 7-Zip executable used for `.7z` archives
    pub seven_zip_path: Option<PathBuf>,
    /// Listen address of the local status API; empty disables it
    pub status_listen: String,
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            username: String::new(),
            password: String::new(),
            token: String::new(),
            auto_login: true,
            concurrency: 3,
            watch_paths: Vec::new(),
            recurse_depth: 4,
            include_extensions: vec![PAYLOAD_EXTENSION.to_string()],
            key_file_name: DEFAULT_KEY_FILE_NAME.to_string(),
            ignore_initial: true,
            periodic_rescan_interval: 5,
            temp_cleanup_interval: 60,
            data_dir: None,
            seven_zip_path: None,
            status_listen: "127.0.0.1:5790".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Clamp numeric fields and canonicalize lists in place.
    pub fn normalize(&mut self) {
        self.api_base_url = self.api_base_url.trim().trim_end_matches('/').to_string();
        if self.client_id.trim().is_empty() {
            self.client_id = uuid::Uuid::new_v4().to_string();
        }

        self.concurrency = self.concurrency.min(MAX_CONCURRENCY);
        self.recurse_depth = self.recurse_depth.clamp(1, MAX_RECURSE_DEPTH);
        self.temp_cleanup_interval = self
            .temp_cleanup_interval
            .clamp(1, MAX_CLEANUP_INTERVAL_MINUTES);

        self.watch_paths = normalize_watch_paths(&self.watch_paths);
        self.include_extensions = normalize_extensions(&self.include_extensions);

        if self.key_file_name.trim().is_empty() {
            self.key_file_name = DEFAULT_KEY_FILE_NAME.to_string();
        }
        self.status_listen = self.status_listen.trim().to_string();
    }

    /// Status API listen address, if enabled
    pub fn status_listen_addr(&self) -> Option<&str> {
        if self.status_listen.is_empty() {
            None
        } else {
            Some(&self.status_listen)
        }
    }

    /// Root directory for the task database, scratch space and logs
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_local_dir().map(|d| d.join("medlog")))
            .unwrap_or_else(|| PathBuf::from("./medlog_data"))
    }

    /// SQLite task database path
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("data").join("upload_tasks.db")
    }

    /// JSON fallback task file path
    pub fn tasks_json_path(&self) -> PathBuf {
        self.data_dir().join("data").join("tasks.json")
    }

    /// Parent of all scratch extraction directories
    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir().join("temp")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.data_dir().join("logs").join("client.log")
    }

    /// True when a login can be attempted
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Resolve absolute, drop empties, dedupe case-insensitively, keep at most
/// [`MAX_WATCH_PATHS`] entries in their original order.
pub fn normalize_watch_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for path in paths {
        if path.as_os_str().is_empty() {
            continue;
        }
        let absolute = if path.is_absolute() {
            path.clone()
        } else {
            cwd.join(path)
        };
        let key = absolute.to_string_lossy().to_lowercase();
        if seen.insert(key) {
            out.push(absolute);
        }
        if out.len() == MAX_WATCH_PATHS {
            break;
        }
    }
    out
}

/// Lowercase, ensure a leading dot, dedupe, and always include `.medbot`.
pub fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for ext in extensions {
        let trimmed = ext.trim().to_lowercase();
        if trimmed.is_empty() || trimmed == "." {
            continue;
        }
        let dotted = if trimmed.starts_with('.') {
            trimmed
        } else {
            format!(".{}", trimmed)
        };
        if !out.contains(&dotted) {
            out.push(dotted);
        }
    }
    if !out.iter().any(|e| e == PAYLOAD_EXTENSION) {
        out.insert(0, PAYLOAD_EXTENSION.to_string());
    }
    out
}

/// Resolve the config file path (CLI argument, env var, platform default).
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = cli_arg {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    dirs::config_dir()
        .map(|d| d.join("medlog").join("agent.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
}

/// Load the config at `path`, writing defaults when the file does not exist.
///
/// An unparsable file is left untouched and defaults are used for this run.
pub fn load_or_create(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let config = AgentConfig::default();
        warn!(
            "Config file not found at {}, writing defaults",
            path.display()
        );
        write_toml_config(&config, path)?;
        return load_normalized(config);
    }

    let content = std::fs::read_to_string(path)?;
    match toml::from_str::<AgentConfig>(&content) {
        Ok(config) => {
            info!("Loaded config from {}", path.display());
            load_normalized(config)
        }
        Err(e) => {
            warn!(
                "Config file {} is invalid ({}), using defaults",
                path.display(),
                e
            );
            load_normalized(AgentConfig::default())
        }
    }
}

fn load_normalized(mut config: AgentConfig) -> Result<AgentConfig> {
    config.normalize();
    Ok(config)
}

/// Store a refreshed bearer token in the config file at `path`.
///
/// The file is re-read so other settings keep their on-disk values. A
/// missing or unparsable file is not touched.
pub fn save_token(path: &Path, token: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let mut config: AgentConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Config file {} is invalid: {}", path.display(), e)))?;
    if config.token == token {
        return Ok(());
    }
    config.token = token.to_string();
    write_toml_config(&config, path)
}

/// Write the (normalized) config atomically: temp file then rename.
pub fn write_toml_config(config: &AgentConfig, path: &Path) -> Result<()> {
    let mut normalized = config.clone();
    normalized.normalize();

    let content = toml::to_string_pretty(&normalized)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
