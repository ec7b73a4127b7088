//! IngestClient against an in-process fake ingestion server

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use medlog_agent::services::ingest_client::{
    BatchFile, IngestApi, IngestClient, IngestError, UploadBatch,
};
use medlog_common::config::{load_or_create, write_toml_config, AgentConfig};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct SeenUpload {
    authorization: Option<String>,
    headers: HashMap<String, String>,
    body: String,
}

#[derive(Default)]
struct ServerState {
    logins: AtomicUsize,
    uploads: Mutex<Vec<SeenUpload>>,
    /// Answer uploads with this status instead of 200
    upload_status: Mutex<Option<StatusCode>>,
}

type Shared = Arc<ServerState>;

fn jwt_expiring_in(secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + secs;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(json!({ "sub": "agent", "exp": exp }).to_string());
    format!("{}.{}.signature", header, claims)
}

async fn login(State(state): State<Shared>) -> Json<serde_json::Value> {
    state.logins.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "token": jwt_expiring_in(3600) }))
}

async fn upload(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let interesting = ["x-device-id", "x-decrypt-key", "x-client-id", "x-upload-source"];
    let seen = SeenUpload {
        authorization: authorization.clone(),
        headers: interesting
            .iter()
            .filter_map(|name| {
                headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect(),
        body: String::from_utf8_lossy(&body).to_string(),
    };
    state.uploads.lock().unwrap().push(seen);

    if authorization.as_deref() == Some("Bearer stale") {
        return (StatusCode::UNAUTHORIZED, "token expired").into_response();
    }
    if let Some(status) = *state.upload_status.lock().unwrap() {
        return (status, "ingest unavailable").into_response();
    }
    Json(json!({ "ok": true })).into_response()
}

async fn auto_fill_key(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    match params.get("device_id").map(String::as_str) {
        Some("4371-04") => Json(json!({ "key": "AA-BB-CC-DD-EE-FF" })).into_response(),
        Some("4380-11") => Json(json!({ "key": "not a mac" })).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_server() -> (SocketAddr, Shared) {
    let state: Shared = Arc::new(ServerState::default());
    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/logs/upload", post(upload))
        .route("/api/logs/auto-fill/key", get(auto_fill_key))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn client_config(addr: SocketAddr, token: &str, with_credentials: bool) -> AgentConfig {
    let mut config = AgentConfig {
        api_base_url: format!("http://{}/api", addr),
        client_id: "client-1".to_string(),
        token: token.to_string(),
        auto_login: true,
        ..AgentConfig::default()
    };
    if with_credentials {
        config.username = "agent".to_string();
        config.password = "secret".to_string();
    }
    config
}

fn batch(dir: &tempfile::TempDir) -> UploadBatch {
    let files = ["1700000000_log.medbot", "1700000001_log.medbot"]
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("payload of {}", name)).unwrap();
            BatchFile {
                path,
                file_name: name.to_string(),
            }
        })
        .collect();
    UploadBatch {
        device_id: "4371-04".to_string(),
        decrypt_key: "aa:bb:cc:dd:ee:ff".to_string(),
        files,
    }
}

#[tokio::test]
async fn test_unauthorized_upload_refreshes_token_and_retries_once() {
    let (addr, state) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let client = IngestClient::new(&client_config(addr, "stale", true)).unwrap();

    client.upload_batch(&batch(&dir)).await.unwrap();

    assert_eq!(state.logins.load(Ordering::SeqCst), 1);
    let uploads = state.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].authorization.as_deref(), Some("Bearer stale"));
    let retried = &uploads[1];
    assert!(retried.authorization.as_deref().unwrap().starts_with("Bearer "));
    assert_ne!(retried.authorization.as_deref(), Some("Bearer stale"));

    assert_eq!(retried.headers["x-device-id"], "4371-04");
    assert_eq!(retried.headers["x-decrypt-key"], "aa:bb:cc:dd:ee:ff");
    assert_eq!(retried.headers["x-client-id"], "client-1");
    assert_eq!(retried.headers["x-upload-source"], "auto-upload");

    assert_eq!(retried.body.matches("name=\"files\"").count(), 2);
    assert!(retried.body.contains("filename=\"1700000000_log.medbot\""));
    assert!(retried.body.contains("payload of 1700000001_log.medbot"));
}

#[tokio::test]
async fn test_fresh_token_is_reused() {
    let (addr, state) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let client = IngestClient::new(&client_config(addr, "", true)).unwrap();

    client.upload_batch(&batch(&dir)).await.unwrap();
    client.upload_batch(&batch(&dir)).await.unwrap();

    assert_eq!(state.logins.load(Ordering::SeqCst), 1);
    assert_eq!(state.uploads.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_token_near_expiry_is_refreshed_before_upload() {
    let (addr, state) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let client = IngestClient::new(&client_config(addr, &jwt_expiring_in(60), true)).unwrap();

    client.upload_batch(&batch(&dir)).await.unwrap();

    assert_eq!(state.logins.load(Ordering::SeqCst), 1);
    assert_eq!(state.uploads.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unauthorized_without_credentials_fails() {
    let (addr, state) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let client = IngestClient::new(&client_config(addr, "stale", false)).unwrap();

    let result = client.upload_batch(&batch(&dir)).await;

    assert!(matches!(result, Err(IngestError::Unauthorized { status: 401, .. })));
    assert_eq!(state.logins.load(Ordering::SeqCst), 0);
    assert_eq!(state.uploads.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_server_error_fails_batch() {
    let (addr, state) = start_server().await;
    *state.upload_status.lock().unwrap() = Some(StatusCode::INTERNAL_SERVER_ERROR);
    let dir = tempfile::tempdir().unwrap();
    let client = IngestClient::new(&client_config(addr, "valid", false)).unwrap();

    match client.upload_batch(&batch(&dir)).await {
        Err(IngestError::Server { status, message }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "ingest unavailable");
        }
        other => panic!("expected server error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_file_fails_before_sending() {
    let (addr, state) = start_server().await;
    let client = IngestClient::new(&client_config(addr, "valid", false)).unwrap();
    let missing = UploadBatch {
        device_id: "4371-04".to_string(),
        decrypt_key: "aa:bb:cc:dd:ee:ff".to_string(),
        files: vec![BatchFile {
            path: "/no/such/1700000000_log.medbot".into(),
            file_name: "1700000000_log.medbot".to_string(),
        }],
    };

    assert!(matches!(
        client.upload_batch(&missing).await,
        Err(IngestError::Io(_))
    ));
    assert!(state.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_key_auto_fill() {
    let (addr, _state) = start_server().await;
    let client = IngestClient::new(&client_config(addr, "valid", false)).unwrap();

    assert_eq!(
        client.lookup_key("4371-04").await.unwrap().as_deref(),
        Some("aa-bb-cc-dd-ee-ff")
    );
    assert_eq!(client.lookup_key("4380-11").await.unwrap(), None);
    assert_eq!(client.lookup_key("0000-00").await.unwrap(), None);
}

#[tokio::test]
async fn test_refreshed_token_is_saved_to_config_file() {
    let (addr, state) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("agent.toml");
    let config = client_config(addr, "stale", true);
    write_toml_config(&config, &config_path).unwrap();

    let client = IngestClient::new(&config)
        .unwrap()
        .with_token_file(config_path.clone());
    client.upload_batch(&batch(&dir)).await.unwrap();

    assert_eq!(state.logins.load(Ordering::SeqCst), 1);
    let saved = load_or_create(&config_path).unwrap();
    assert_ne!(saved.token, "stale");
    assert_eq!(
        state.uploads.lock().unwrap()[1].authorization.as_deref(),
        Some(format!("Bearer {}", saved.token).as_str())
    );
    assert_eq!(saved.api_base_url, config.api_base_url);
}
