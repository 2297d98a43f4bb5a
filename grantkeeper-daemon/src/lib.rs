//! Grantkeeper Daemon Library
//!
//! The daemon holds OAuth2 tokens for the configured accounts and serves
//! them over a Unix control socket. An HTTPS (or HTTP) listener receives the
//! provider's authorization redirect. This library exposes the pieces for
//! testing and embedding.

pub mod commands;
pub mod config;
pub mod control;
pub mod daemon;
pub mod http;
pub mod state;
pub mod sweep;

pub use config::{DaemonConfig, load_config};
pub use daemon::Daemon;
pub use state::{DaemonInfo, DaemonState};
