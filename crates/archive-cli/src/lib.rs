//! Shared plumbing for the three `archive-cli` binaries: configuration,
//! logging setup, and a minimal progress sink (spec §6 "the renderer
//! itself is out of scope"). The attachment downloader lives in
//! `archive-rest` alongside the REST client it shares a `reqwest::Client`
//! with.

mod config;
mod progress;

pub use config::{AccountFileEntry, Config};
pub use progress::{progress_sink, NoOpProgressSink, ProgressSink, StderrProgressSink, StatsMode};

/// Installs a `tracing-subscriber` `EnvFilter` built from `--log LEVEL`,
/// falling back to `info` (spec §6).
pub fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
