//! Database initialization
//!
//! The agent keeps no long-lived pool: every store operation opens its own
//! connection through [`open_connection`] and drops it when done, so the
//! database file is never held open between operations.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// SQLite busy timeout applied to every connection
pub const BUSY_TIMEOUT_MS: u64 = 5000;

/// Open a connection to the task database, creating the file if needed.
pub async fn open_connection(db_path: &Path) -> Result<SqliteConnection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        .disable_statement_logging();

    let conn = options.connect().await?;
    Ok(conn)
}

/// Open the database once, create the schema and close the connection.
///
/// Used at startup to decide whether SQLite is usable at all.
pub async fn init_task_database(db_path: &Path) -> Result<()> {
    let newly_created = !db_path.exists();
    let mut conn = open_connection(db_path).await?;
    create_upload_tasks_table(&mut conn).await?;
    conn.close().await?;

    if newly_created {
        info!("Initialized new task database: {}", db_path.display());
    } else {
        info!("Opened existing task database: {}", db_path.display());
    }
    Ok(())
}

/// Create the upload_tasks table
///
/// One row per logical file path. `decrypt_key` and `upload_path` are kept so
/// unfinished rows can be re-sent after a restart.
pub async fn create_upload_tasks_table(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_tasks (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL,
            file_path TEXT NOT NULL UNIQUE,
            upload_path TEXT,
            decrypt_key TEXT,
            file_hash TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'uploading', 'success', 'failed')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_upload_tasks_hash_status ON upload_tasks(file_hash, status)",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}
