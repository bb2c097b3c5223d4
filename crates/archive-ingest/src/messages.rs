//! Per-channel message backfill (spec §4.G.2): `sync_messages` pages
//! `GET /channels/{id}/messages?after=...` forward from the last stored id,
//! walking each page oldest-to-newest and committing messages with
//! reactions or attachments in their own transaction, batching the rest.

use archive_rest::{RestClient, RestError};
use archive_store::{AddSnapshotResult, BlobStore, Downloader, MessageWriteContext, PendingDownload, Store};
use archive_types::{ChannelId, GuildId, Timing};
use archive_wire::model::Message;
use archive_wire::rest::{Bucket, Route};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::IngestError;

/// The parts of a channel's identity that every message written during its
/// backfill shares (spec §4.A.3's `MessageWriteContext`, minus the
/// per-message author name).
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub parent_channel_id: Option<ChannelId>,
    pub channel_name: String,
    pub guild_name: String,
}

fn author_name(msg: &Message) -> String {
    msg.author.as_ref().map(|a| a.username.clone()).unwrap_or_else(|| "unknown".to_string())
}

fn write_context(ctx: &ChannelContext, msg: &Message) -> MessageWriteContext {
    MessageWriteContext {
        channel_id: ctx.channel_id.get() as i64,
        guild_id: ctx.guild_id.map(|g| g.get() as i64),
        parent_channel_id: ctx.parent_channel_id.map(|c| c.get() as i64),
        author_name: author_name(msg),
        channel_name: ctx.channel_name.clone(),
        guild_name: ctx.guild_name.clone(),
    }
}

pub(crate) fn emoji_key(emoji: &archive_wire::model::Emoji) -> String {
    match (emoji.id, &emoji.name) {
        (Some(id), Some(name)) => format!("{name}:{}", id.get()),
        (Some(id), None) => id.get().to_string(),
        (None, Some(name)) => name.clone(),
        (None, None) => String::new(),
    }
}

/// Lists every user who placed a reaction, paging `after` until a short
/// page signals the end (spec §4.G.2 "listing reactions via
/// `/reactions/{emoji}?after=...&type=...`").
async fn list_reaction_users(
    rest: &RestClient,
    channel: ChannelId,
    message_id: archive_types::MessageId,
    emoji: &str,
    burst: bool,
    abort: &CancellationToken,
) -> Result<Vec<i64>, RestError> {
    let mut users = Vec::new();
    let mut after = 0i64;
    loop {
        let path = format!("/channels/{}/messages/{}/reactions/{}", channel.get(), message_id.get(), emoji);
        let after_s = after.to_string();
        let kind = if burst { "1" } else { "0" };
        let resp = rest
            .request(
                Bucket::message(Route::GetReactions, channel, message_id),
                Method::GET,
                &path,
                &[("after", &after_s), ("limit", "100"), ("type", kind)],
                abort,
            )
            .await?;
        let Value::Array(page) = resp.body else { break };
        if page.is_empty() {
            break;
        }
        let page_len = page.len();
        for user in &page {
            if let Some(id) = user.get("id").and_then(Value::as_str).and_then(|s| s.parse::<i64>().ok()) {
                after = after.max(id);
                users.push(id);
            }
        }
        if page_len < 100 {
            break;
        }
    }
    Ok(users)
}

async fn download_attachments(store: &Store, blobs: &BlobStore, downloader: &dyn Downloader, msg: &Message) -> Result<Vec<PendingDownload>, IngestError> {
    let mut downloads = Vec::with_capacity(msg.attachments.len());
    for att in &msg.attachments {
        let pending = blobs.download_if_needed(store, att.url.clone(), att.proxy_url.clone(), downloader).await?;
        downloads.push(pending);
    }
    Ok(downloads)
}

/// Commits one message that carries reactions or attachments in its own
/// file+db transaction, after resolving its reaction placements and
/// attachment downloads up front (spec §4.G.2).
async fn commit_special_message(
    rest: &RestClient,
    store: &Store,
    blobs: &BlobStore,
    downloader: &dyn Downloader,
    ctx: &ChannelContext,
    msg: &Message,
    timing: Timing,
    abort: &CancellationToken,
) -> Result<AddSnapshotResult, IngestError> {
    let mut reaction_placements = Vec::new();
    for reaction in &msg.reactions {
        let key = emoji_key(&reaction.emoji);
        let users = list_reaction_users(rest, ctx.channel_id, msg.id, &key, reaction.burst, abort).await?;
        reaction_placements.push((key, reaction.emoji.id.map(|i| i.get() as i64), reaction.emoji.name.clone(), reaction.burst, users));
    }

    let downloads = download_attachments(store, blobs, downloader, msg).await?;

    let write_ctx = write_context(ctx, msg);
    let msg_value = serde_json::to_value(msg).expect("message always serializes");
    let message_id = msg.id.get() as i64;
    let result_slot = std::sync::Arc::new(std::sync::Mutex::new(AddSnapshotResult::SameAsLatest));
    let result_slot_write = result_slot.clone();

    blobs
        .perform_file_transaction(store, downloads, move |conn| {
            let result = archive_store::add_message_snapshot(conn, &write_ctx, &msg_value, timing)?;
            *result_slot_write.lock().expect("result slot poisoned") = result;
            for (key, emoji_id, emoji_name, burst, users) in &reaction_placements {
                for user_id in users {
                    archive_store::add_reaction_placement(conn, message_id, key, *emoji_id, emoji_name.as_deref(), *burst, *user_id, timing)?;
                }
            }
            Ok(())
        })
        .await?;

    let result = *result_slot.lock().expect("result slot poisoned");
    Ok(result)
}

/// Commits a run of plain messages (no reactions, no attachments) in one
/// transaction, oldest to newest, returning the last message's write
/// result.
async fn commit_batch(store: &Store, ctx: &ChannelContext, batch: Vec<Message>, timing: Timing) -> Result<Option<AddSnapshotResult>, IngestError> {
    if batch.is_empty() {
        return Ok(None);
    }
    let contexts: Vec<MessageWriteContext> = batch.iter().map(|m| write_context(ctx, m)).collect();
    let values: Vec<Value> = batch.iter().map(|m| serde_json::to_value(m).expect("message always serializes")).collect();

    let result = store
        .with_conn(move |conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let outcome = (|| -> Result<AddSnapshotResult, archive_store::StoreError> {
                let mut last = AddSnapshotResult::SameAsLatest;
                for (write_ctx, value) in contexts.iter().zip(values.iter()) {
                    last = archive_store::add_message_snapshot(conn, write_ctx, value, timing)?;
                }
                Ok(last)
            })();
            match outcome {
                Ok(last) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(last)
                }
                Err(e) => {
                    conn.execute_batch("ROLLBACK").ok();
                    Err(e)
                }
            }
        })
        .await?;
    Ok(Some(result))
}

/// `sync_messages(account, channel)` (spec §4.G.2). Returns cleanly
/// (`Ok(())`) both on reaching previously-archived state and on a
/// 403/404/abort pause — only an account-fatal error (401) propagates.
#[allow(clippy::too_many_arguments)]
pub async fn sync_messages(
    rest: &RestClient,
    store: &Store,
    blobs: &BlobStore,
    downloader: &dyn Downloader,
    ctx: &ChannelContext,
    abort: &CancellationToken,
) -> Result<(), IngestError> {
    let channel_id_i64 = ctx.channel_id.get() as i64;
    let starting_after = store.with_conn(move |conn| archive_store::last_message_id(conn, channel_id_i64)).await?;
    let mut after = starting_after.unwrap_or(0);

    loop {
        let after_s = after.to_string();
        let path = format!("/channels/{}/messages", ctx.channel_id.get());
        let resp = match rest
            .request(Bucket::channel(Route::GetChannelMessages, ctx.channel_id), Method::GET, &path, &[("after", &after_s), ("limit", "100")], abort)
            .await
        {
            Ok(resp) => resp,
            Err(RestError::Aborted) => return Ok(()),
            Err(RestError::Unauthorized) => return Err(IngestError::Rest(RestError::Unauthorized)),
            Err(other) => {
                tracing::warn!(channel = %ctx.channel_id, error = %other, "message backfill stopped on rest error");
                return Ok(());
            }
        };

        if resp.status == StatusCode::FORBIDDEN || resp.status == StatusCode::NOT_FOUND {
            tracing::info!(channel = %ctx.channel_id, status = %resp.status, "message backfill paused pending permission change");
            abort.cancelled().await;
            return Ok(());
        }
        if !resp.status.is_success() {
            tracing::warn!(channel = %ctx.channel_id, status = %resp.status, "message backfill stopped on non-ok response");
            return Ok(());
        }

        let page: Vec<Message> = match serde_json::from_value(resp.body) {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(channel = %ctx.channel_id, error = %e, "message backfill stopped on malformed page");
                return Ok(());
            }
        };
        if page.is_empty() {
            return Ok(());
        }
        let page_len = page.len();
        after = page.iter().map(|m| m.id.get() as i64).max().unwrap_or(after).max(after);

        let timing = Timing::replayed(crate::now_ms());
        let mut batch = Vec::new();
        let mut last_result = None;

        for msg in page.into_iter().rev() {
            let special = !msg.reactions.is_empty() || !msg.attachments.is_empty();
            if special {
                if let Some(result) = commit_batch(store, ctx, std::mem::take(&mut batch), timing).await? {
                    last_result = Some(result);
                }
                last_result = Some(commit_special_message(rest, store, blobs, downloader, ctx, &msg, timing, abort).await?);
            } else {
                batch.push(msg);
            }
        }
        if let Some(result) = commit_batch(store, ctx, batch, timing).await? {
            last_result = Some(result);
        }

        if page_len < 100 {
            return Ok(());
        }
        if last_result != Some(AddSnapshotResult::AddedFirst) {
            return Ok(());
        }
    }
}
