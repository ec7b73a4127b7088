//! # medlog common library
//!
//! Shared code for the medlog log upload agent:
//! - Error type and `Result` alias
//! - TOML configuration model, normalization and loading
//! - SQLite connection setup and the `upload_tasks` schema
//! - Agent events and the broadcast `EventBus`

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
