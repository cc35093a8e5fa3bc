//! PixTools — asynchronous image-processing service.
//!
//! A client uploads an image and a list of operations; the system fans the
//! operations out over broker-backed workers, persists artifacts to an
//! object store, and returns freshly signed URLs once everything settles.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod tasks;
pub mod worker;

use tracing_subscriber::EnvFilter;

/// Initialize structured JSON logging for a process. RUST_LOG-driven.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}
