//! The versioned snapshot store (spec §4.A) and its content-addressed blob
//! store (spec §4.B).
//!
//! Writes are serialized onto one synchronous `rusqlite::Connection`
//! reached through [`Store::with_conn`], which hands the connection to a
//! blocking task — the same "one actor owns the mutable state" shape as
//! `host/scheduler.rs`'s `SchedulerActor`, adapted for a synchronous driver
//! instead of a channel-fed async loop, since `rusqlite` has no async API.

pub mod blob;
mod connection;
pub mod encode;
mod member;
mod message;
mod reaction;
mod search;
mod snapshots;

use std::path::Path;
use std::sync::{Arc, Mutex};

use archive_types::{EntityKind, Timing};
use rusqlite::Connection;

pub use blob::{BlobStore, ConsistencyReport, DownloadOutcome, Downloader, PendingDownload};
pub use member::{add_member_snapshot, get_member_at, sync_members, MemberSnapshot};
pub use message::{add_message_snapshot, last_message_id, mark_message_as_deleted, restore_message_reference, MessageWriteContext};
pub use reaction::{add_reaction_placement, mark_reaction_as_removed, mark_reactions_as_removed_bulk};
pub use search::{search_messages, SearchHit};
pub use snapshots::{children_at, get_snapshot_at, mark_as_deleted, sync_deletions, SnapshotAt};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("write for {kind:?}#{id} is older than the stored latest snapshot")]
    WriteOlderThanLatest { kind: EntityKind, id: i64 },
    #[error("no transaction is active on this store")]
    NoActiveTransaction,
    #[error("a transaction is already active on this store")]
    TransactionAlreadyActive,
    #[error("store task panicked")]
    WorkerPanicked,
}

/// Result of `add_snapshot` (spec §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddSnapshotResult {
    AddedFirst,
    AddedAnother,
    SameAsLatest,
    PartialNoSnapshot,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AddSnapshotOptions {
    pub partial: bool,
    pub check_if_changed: bool,
}

impl AddSnapshotOptions {
    pub fn new() -> Self {
        Self {
            partial: false,
            check_if_changed: true,
        }
    }

    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn no_change_check(mut self) -> Self {
        self.check_if_changed = false;
        self
    }
}

/// A handle to the snapshot store. Cheaply `Clone`-able; every clone shares
/// the same underlying writer connection via the inner mutex.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Store, StoreError> {
        let conn = connection::open(path)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Store, StoreError> {
        let conn = connection::open_in_memory()?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the writer connection on a blocking task. This is
    /// the only place `rusqlite` is touched directly from async code
    /// (spec §5: "no operation may hold the store writer across a
    /// suspension other than the store's own synchronous SQL calls").
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("store connection mutex poisoned");
            f(&guard)
        })
        .await
        .map_err(|_| StoreError::WorkerPanicked)?
    }

    pub async fn transaction_begin(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            if conn.is_autocommit() {
                conn.execute_batch("BEGIN IMMEDIATE")?;
                Ok(())
            } else {
                Err(StoreError::TransactionAlreadyActive)
            }
        })
        .await
    }

    pub async fn commit(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            if conn.is_autocommit() {
                Err(StoreError::NoActiveTransaction)
            } else {
                conn.execute_batch("COMMIT")?;
                Ok(())
            }
        })
        .await
    }

    pub async fn rollback(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            if conn.is_autocommit() {
                Err(StoreError::NoActiveTransaction)
            } else {
                conn.execute_batch("ROLLBACK")?;
                Ok(())
            }
        })
        .await
    }

    /// `PRAGMA optimize`, run once at clean shutdown (spec §4.G.6).
    pub async fn close(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| connection::optimize(conn)).await
    }

    /// `add_snapshot` for the seven entity kinds keyed by a single
    /// snowflake id (everything except `member` and `message`, which have
    /// their own entry points due to composite keys / special-case
    /// semantics, spec §4.A).
    pub async fn add_snapshot(
        &self,
        kind: EntityKind,
        id: u64,
        obj: serde_json::Value,
        timing: Timing,
        opts: AddSnapshotOptions,
    ) -> Result<AddSnapshotResult, StoreError> {
        self.with_conn(move |conn| snapshots::add_snapshot(conn, kind, id as i64, &obj, timing, opts))
            .await
    }
}

pub(crate) fn encode_timing(t: Timing) -> i64 {
    t.encode()
}

pub(crate) fn decode_timing(raw: i64) -> Timing {
    Timing::decode(raw)
}
