//! Database utilities

pub mod init;

pub use init::{create_upload_tasks_table, init_task_database, open_connection};
