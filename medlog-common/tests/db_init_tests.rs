//! Tests for task database initialization

use medlog_common::db::{init_task_database, open_connection};
use sqlx::Connection;

#[tokio::test]
async fn test_database_created_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data").join("upload_tasks.db");

    let result = init_task_database(&db_path).await;
    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.db");

    init_task_database(&db_path).await.unwrap();
    let second = init_task_database(&db_path).await;
    assert!(second.is_ok(), "Failed to reopen database: {:?}", second.err());
}

#[tokio::test]
async fn test_upload_tasks_schema() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.db");
    init_task_database(&db_path).await.unwrap();

    let mut conn = open_connection(&db_path).await.unwrap();
    let columns: Vec<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info('upload_tasks')")
            .fetch_all(&mut conn)
            .await
            .unwrap();

    for expected in [
        "id",
        "device_id",
        "file_path",
        "upload_path",
        "decrypt_key",
        "file_hash",
        "status",
        "retry_count",
        "last_error",
        "created_at",
        "updated_at",
    ] {
        assert!(columns.iter().any(|c| c == expected), "missing column {}", expected);
    }

    let index: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND name = 'idx_upload_tasks_hash_status'",
    )
    .fetch_optional(&mut conn)
    .await
    .unwrap();
    assert!(index.is_some());

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_status_check_constraint_rejects_unknown_status() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.db");
    init_task_database(&db_path).await.unwrap();

    let mut conn = open_connection(&db_path).await.unwrap();
    let result = sqlx::query(
        "INSERT INTO upload_tasks (id, device_id, file_path, status, created_at, updated_at)
         VALUES ('a', '4371-04', '/x', 'exploded', '2024-01-01', '2024-01-01')",
    )
    .execute(&mut conn)
    .await;
    assert!(result.is_err());
}
