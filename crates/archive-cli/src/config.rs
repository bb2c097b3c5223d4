//! `archive` binary configuration (spec §6). Accounts live in their own
//! JSON file rather than the top-level flags, since their number is
//! unbounded and each one carries a bot token.

use std::path::PathBuf;

use archive_scheduler::RegisterOptions;
use archive_types::AccountId;
use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "archive", about = "Continuously archives one or more chat-service accounts into a local snapshot store")]
pub struct Config {
    /// Path to the sqlite snapshot database, created if missing.
    #[arg(long)]
    pub store: PathBuf,

    /// Directory attachment and icon blobs are written under.
    #[arg(long)]
    pub blobs: PathBuf,

    /// JSON file listing the accounts to register on startup.
    #[arg(long)]
    pub accounts: PathBuf,

    /// `off|error|warn|info|debug|trace`.
    #[arg(long, default_value = "info")]
    pub log: String,

    /// Whether to render a terminal progress/stats line.
    #[arg(long, default_value = "auto")]
    pub stats: crate::progress::StatsMode,
}

impl Config {
    pub fn load_accounts(&self) -> anyhow::Result<Vec<AccountFileEntry>> {
        let raw = std::fs::read_to_string(&self.accounts)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// One account entry in the accounts JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountFileEntry {
    pub id: u32,
    pub bot: bool,
    pub token: String,
    pub gateway_url: String,
    pub intents: u64,
    #[serde(default)]
    pub rest_base_url: Option<String>,
    #[serde(default = "default_requests_per_second")]
    pub global_requests_per_second: u32,
}

fn default_requests_per_second() -> u32 {
    50
}

impl From<AccountFileEntry> for RegisterOptions {
    fn from(entry: AccountFileEntry) -> Self {
        RegisterOptions {
            id: AccountId(entry.id),
            bot: entry.bot,
            token: entry.token,
            gateway_url: entry.gateway_url,
            intents: entry.intents,
            rest_base_url: entry.rest_base_url,
            global_requests_per_second: entry.global_requests_per_second,
        }
    }
}
