//! Ingestion API client
//!
//! Talks to the three admin-backend endpoints the agent depends on:
//! - `POST {base}/auth/login` → `{ "token": "..." }`
//! - `POST {base}/logs/upload` (multipart, field `files`, one part per file)
//! - `GET  {base}/logs/auto-fill/key?device_id=...` → `{ "key": "..." }`
//!
//! The bearer token is refreshed proactively when it expires within five
//! minutes (expiry read from the JWT `exp` claim) and forcibly refreshed once
//! when the server answers 401/403, after which the request is retried once.
//! A freshly obtained token is written back to the config file when one is
//! attached with [`IngestClient::with_token_file`].

use crate::services::key_extractor::is_mac_like;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use medlog_common::config::{save_token, AgentConfig};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

const USER_AGENT: &str = concat!("medlog-agent/", env!("CARGO_PKG_VERSION"));

/// Refresh the token when it expires sooner than this
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Ingestion client errors
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One file of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFile {
    /// Real path read at send time
    pub path: PathBuf,
    /// Name reported to the server (original file name)
    pub file_name: String,
}

/// A batch of files sharing device id and decrypt key
#[derive(Debug, Clone, PartialEq)]
pub struct UploadBatch {
    pub device_id: String,
    pub decrypt_key: String,
    pub files: Vec<BatchFile>,
}

/// Operations the agent needs from the ingestion backend
#[async_trait]
pub trait IngestApi: Send + Sync {
    /// Transmit one batch; any error fails the whole batch
    async fn upload_batch(&self, batch: &UploadBatch) -> Result<(), IngestError>;

    /// Previously known key for a device, if the backend has one
    async fn lookup_key(&self, device_id: &str) -> Result<Option<String>, IngestError>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

#[derive(Deserialize)]
struct KeyResponse {
    key: Option<String>,
}

#[derive(Debug, Default)]
struct AuthSession {
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// Expiry from the `exp` claim of a JWT, if the token is one
pub fn parse_jwt_exp(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

/// reqwest-based [`IngestApi`] implementation
pub struct IngestClient {
    http_client: reqwest::Client,
    api_base_url: String,
    client_id: String,
    username: String,
    password: String,
    auto_login: bool,
    session: Mutex<AuthSession>,
    token_file: Option<PathBuf>,
}

impl IngestClient {
    pub fn new(config: &AgentConfig) -> Result<Self, IngestError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| IngestError::Network(e.to_string()))?;

        let token = (!config.token.is_empty()).then(|| config.token.clone());
        let expires_at = token.as_deref().and_then(parse_jwt_exp);

        Ok(Self {
            http_client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            auto_login: config.auto_login,
            session: Mutex::new(AuthSession { token, expires_at }),
            token_file: None,
        })
    }

    /// Persist refreshed tokens into the config file at `path`
    pub fn with_token_file(mut self, path: PathBuf) -> Self {
        self.token_file = Some(path);
        self
    }

    fn upload_url(&self) -> String {
        format!("{}/logs/upload", self.api_base_url)
    }

    fn key_lookup_url(&self) -> String {
        format!("{}/logs/auto-fill/key", self.api_base_url)
    }

    /// Login lives under `/api/auth/login` on the server root, whether or
    /// not the configured base already ends in `/api`.
    fn login_url(&self) -> String {
        let root = self
            .api_base_url
            .strip_suffix("/api")
            .unwrap_or(&self.api_base_url);
        format!("{}/api/auth/login", root)
    }

    fn can_login(&self) -> bool {
        self.auto_login && !self.username.is_empty() && !self.password.is_empty()
    }

    /// Current token, logging in when missing, near expiry, or `force`d
    pub async fn ensure_token(&self, force: bool) -> Result<Option<String>, IngestError> {
        let mut session = self.session.lock().await;

        let fresh = match (&session.token, session.expires_at) {
            (Some(_), Some(exp)) => {
                exp - Utc::now() > ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS)
            }
            (Some(_), None) => true,
            (None, _) => false,
        };

        if (fresh && !force) || !self.can_login() {
            return Ok(session.token.clone());
        }

        let token = self.login().await?;
        session.expires_at = parse_jwt_exp(&token);
        session.token = Some(token.clone());
        tracing::info!(expires_at = ?session.expires_at, "Obtained bearer token");
        self.persist_token(&token).await;
        Ok(Some(token))
    }

    async fn persist_token(&self, token: &str) {
        let Some(path) = self.token_file.clone() else {
            return;
        };
        let token = token.to_string();
        let result = tokio::task::spawn_blocking(move || save_token(&path, &token)).await;
        match result {
            Ok(Ok(())) => tracing::debug!("Bearer token saved to config"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Could not save bearer token to config"),
            Err(e) => tracing::warn!(error = %e, "Token save task failed"),
        }
    }

    async fn login(&self) -> Result<String, IngestError> {
        let response = self
            .http_client
            .post(self.login_url())
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .map_err(|e| IngestError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Parse(e.to_string()))?;
        body.token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| IngestError::Parse("login response has no token".to_string()))
    }

    async fn build_form(batch: &UploadBatch) -> Result<Form, IngestError> {
        let mut form = Form::new();
        for file in &batch.files {
            let handle = tokio::fs::File::open(&file.path).await?;
            let len = handle.metadata().await?.len();
            let body = reqwest::Body::wrap_stream(ReaderStream::new(handle));
            let part = Part::stream_with_length(body, len)
                .file_name(file.file_name.clone())
                .mime_str("application/octet-stream")
                .map_err(|e| IngestError::Parse(e.to_string()))?;
            form = form.part("files", part);
        }
        Ok(form)
    }

    async fn send_batch(
        &self,
        batch: &UploadBatch,
        token: Option<&str>,
    ) -> Result<reqwest::Response, IngestError> {
        let form = Self::build_form(batch).await?;
        let mut request = self
            .http_client
            .post(self.upload_url())
            .header("X-Upload-Source", "auto-upload")
            .header("X-Client-Id", &self.client_id)
            .header("X-Device-Id", &batch.device_id)
            .header("X-Decrypt-Key", &batch.decrypt_key)
            .multipart(form);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .map_err(|e| IngestError::Network(e.to_string()))
    }
}

fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn classify_status(status: StatusCode, message: String) -> IngestError {
    let message: String = message.chars().take(500).collect();
    if is_auth_status(status) {
        IngestError::Unauthorized {
            status: status.as_u16(),
            message,
        }
    } else {
        IngestError::Server {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl IngestApi for IngestClient {
    async fn upload_batch(&self, batch: &UploadBatch) -> Result<(), IngestError> {
        let token = self.ensure_token(false).await?;
        let mut response = self.send_batch(batch, token.as_deref()).await?;

        if is_auth_status(response.status()) {
            tracing::warn!(
                status = response.status().as_u16(),
                "Upload rejected as unauthorized, refreshing token and retrying once"
            );
            let token = self.ensure_token(true).await?;
            response = self.send_batch(batch, token.as_deref()).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }

        tracing::debug!(
            device_id = %batch.device_id,
            files = batch.files.len(),
            "Batch accepted by ingestion endpoint"
        );
        Ok(())
    }

    async fn lookup_key(&self, device_id: &str) -> Result<Option<String>, IngestError> {
        let token = self.ensure_token(false).await?;
        let mut request = self
            .http_client
            .get(self.key_lookup_url())
            .query(&[("device_id", device_id)]);
        if let Some(token) = token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IngestError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }

        let body: KeyResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Parse(e.to_string()))?;

        Ok(body
            .key
            .filter(|k| is_mac_like(k))
            .map(|k| k.trim().to_lowercase()))
    }
}
