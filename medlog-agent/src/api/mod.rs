//! Local status API
//!
//! Loopback-only HTTP surface: health, queue status and the concurrency
//! switch used to pause and resume uploads.

pub mod health;
pub mod status;

pub use health::health_routes;
pub use status::status_routes;
