//! Ingestion controller (spec §4.G): the single task that owns the
//! in-memory mirror, drives initial sync and backfill, and applies gateway
//! dispatch events to the snapshot store.

mod controller;
mod dispatch;
mod error;
mod messages;
mod mirror;
mod permissions;
mod threads;

use std::time::{SystemTime, UNIX_EPOCH};

pub use controller::{ControllerMessage, IngestController};
pub use error::IngestError;
pub use messages::ChannelContext;
pub use mirror::{CachedChannel, CachedGuild, Mirror};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
