//! Bootgate - boots a loopback HTTP backend on first use and forwards invocations to it
//!
//! This library adapts a request/response invocation platform to a
//! long-running HTTP service that takes a while to come up:
//! - Launches the backend process exactly once per adapter process
//! - Translates invocation events into loopback HTTP requests
//! - Retries refused connections while the backend is still booting
//! - Returns every backend body base64 encoded
//! - Maps unreachable and failed forwards to plain-text 503/500 responses

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod response;
pub mod server;
pub mod startup;
pub mod translate;

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
