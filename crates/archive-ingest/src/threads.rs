//! Archived-thread enumeration (spec §4.G.3): pages threads before a
//! cursor, writes each page's thread snapshots in one transaction, and
//! hands every thread back to the caller so it can spawn a message sync
//! on a read-permitted account.

use archive_rest::{RestClient, RestError};
use archive_scheduler::ThreadVariant;
use archive_store::{AddSnapshotOptions, Store, StoreError};
use archive_types::{ChannelId, EntityKind, Timing};
use archive_wire::model::Thread;
use archive_wire::rest::{Bucket, Route};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::IngestError;

#[derive(Debug, Deserialize)]
struct ArchivedThreadsPage {
    threads: Vec<Thread>,
    #[serde(default)]
    has_more: bool,
}

fn route_for(variant: ThreadVariant) -> (Route, &'static str) {
    match variant {
        ThreadVariant::Public => (Route::GetPublicArchivedThreads, "public"),
        ThreadVariant::Private | ThreadVariant::JoinedPrivate => (Route::GetPrivateArchivedThreads, "private"),
    }
}

async fn write_thread_page(store: &Store, threads: &[Thread], timing: Timing) -> Result<(), StoreError> {
    store.transaction_begin().await?;
    let result: Result<(), StoreError> = async {
        for thread in threads {
            let value = serde_json::to_value(thread).expect("thread always serializes");
            let id = thread.id.get();
            store.add_snapshot(EntityKind::Thread, id, value, timing, AddSnapshotOptions::new()).await?;
        }
        Ok(())
    }
    .await;
    match result {
        Ok(()) => store.commit().await,
        Err(e) => {
            store.rollback().await.ok();
            Err(e)
        }
    }
}

/// `sync_all_archived_threads(channel, variant)` (spec §4.G.3). `on_thread`
/// is invoked once per thread after its page has committed, so the caller
/// can schedule a message sync without this module knowing about the
/// scheduler or the in-memory mirror.
pub async fn sync_all_archived_threads<F>(
    rest: &RestClient,
    store: &Store,
    channel: ChannelId,
    variant: ThreadVariant,
    abort: &CancellationToken,
    mut on_thread: F,
) -> Result<(), IngestError>
where
    F: FnMut(&Thread),
{
    let (route, variant_path) = route_for(variant);
    let mut before: Option<String> = None;

    loop {
        let path = format!("/channels/{}/threads/archived/{variant_path}", channel.get());
        let before_owned = before.clone().unwrap_or_default();
        let mut query: Vec<(&str, &str)> = vec![("limit", "100")];
        if before.is_some() {
            query.push(("before", &before_owned));
        }

        let resp = match rest.request(Bucket::channel(route, channel), Method::GET, &path, &query, abort).await {
            Ok(resp) => resp,
            Err(RestError::Aborted) => return Ok(()),
            Err(RestError::Unauthorized) => return Err(IngestError::Rest(RestError::Unauthorized)),
            Err(other) => {
                tracing::warn!(%channel, error = %other, "archived thread sync stopped on rest error");
                return Ok(());
            }
        };

        if resp.status == StatusCode::FORBIDDEN || resp.status == StatusCode::NOT_FOUND {
            tracing::info!(%channel, status = %resp.status, "archived thread sync paused pending permission change");
            abort.cancelled().await;
            return Ok(());
        }
        if !resp.status.is_success() {
            tracing::warn!(%channel, status = %resp.status, "archived thread sync stopped on non-ok response");
            return Ok(());
        }

        let page: ArchivedThreadsPage = match serde_json::from_value(resp.body) {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(%channel, error = %e, "archived thread sync stopped on malformed page");
                return Ok(());
            }
        };
        if page.threads.is_empty() {
            return Ok(());
        }

        let timing = Timing::replayed(crate::now_ms());
        write_thread_page(store, &page.threads, timing).await?;
        for thread in &page.threads {
            on_thread(thread);
        }

        before = page
            .threads
            .iter()
            .filter_map(|t| t.thread_metadata.as_ref().map(|m| m.archive_timestamp.clone()))
            .min();

        if !page.has_more || before.is_none() {
            return Ok(());
        }
    }
}
