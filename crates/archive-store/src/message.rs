//! Message snapshot writes (spec §4.A.3): the embed-lag special case,
//! webhook author interning, message-reference compression and the FTS
//! side-table write, all inside the caller's transaction.

use archive_types::Timing;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::{decode_timing, encode_timing, AddSnapshotResult, StoreError};

/// Everything the message write path needs about the containing channel
/// that isn't part of the message payload itself: denormalized names for
/// the FTS index, and the channel/guild ids message-reference compression
/// is relative to (spec §4.A "Message reference compression").
#[derive(Debug, Clone)]
pub struct MessageWriteContext {
    pub channel_id: i64,
    pub guild_id: Option<i64>,
    pub parent_channel_id: Option<i64>,
    pub author_name: String,
    pub channel_name: String,
    pub guild_name: String,
}

struct ExistingMessage {
    timestamp: i64,
}

fn load_existing(conn: &Connection, id: i64) -> Result<Option<ExistingMessage>, StoreError> {
    let row = conn
        .query_row(
            "SELECT _timestamp FROM latest_message_snapshots WHERE id = ?1",
            [id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?;
    Ok(row.map(|timestamp| ExistingMessage { timestamp }))
}

fn parse_rfc3339_ms(s: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

fn content_timestamp(msg: &Value, realtime: bool) -> i64 {
    let ms = msg
        .get("edited_timestamp")
        .and_then(Value::as_str)
        .map(parse_rfc3339_ms)
        .unwrap_or(0) as u64;
    Timing::new(ms, realtime).encode()
}

/// Finds or creates the `webhook_users` surrogate for a webhook-authored
/// message (spec §4.A "Message author interning").
fn intern_webhook_author(conn: &Connection, webhook_id: i64, name: &str, avatar: Option<&str>) -> Result<i64, StoreError> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM webhook_users WHERE webhook_id = ?1 AND name = ?2",
            params![webhook_id, name],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO webhook_users (webhook_id, name, avatar) VALUES (?1, ?2, ?3)",
        params![webhook_id, name, avatar],
    )?;
    let id = conn.last_insert_rowid();
    if id >= (1i64 << 32) {
        tracing::error!(id, "webhook surrogate id escaped the reserved range");
    }
    Ok(id)
}

/// Compresses a message-reference id relative to the containing channel
/// and its parent: `0` if it equals the containing channel/guild, `1` if
/// it equals the parent, otherwise the id itself.
fn compress_ref_channel(ctx: &MessageWriteContext, id: Option<i64>) -> Option<i64> {
    let id = id?;
    if id == ctx.channel_id {
        Some(0)
    } else if Some(id) == ctx.parent_channel_id {
        Some(1)
    } else {
        Some(id)
    }
}

fn compress_ref_guild(ctx: &MessageWriteContext, id: Option<i64>) -> Option<i64> {
    let id = id?;
    if Some(id) == ctx.guild_id {
        Some(0)
    } else {
        Some(id)
    }
}

fn decompress_ref_channel(ctx: &MessageWriteContext, stored: Option<i64>) -> Option<i64> {
    match stored {
        Some(0) => Some(ctx.channel_id),
        Some(1) => ctx.parent_channel_id,
        other => other,
    }
}

fn decompress_ref_guild(ctx: &MessageWriteContext, stored: Option<i64>) -> Option<i64> {
    match stored {
        Some(0) => ctx.guild_id,
        other => other,
    }
}

fn write_attachments(conn: &Connection, message_id: i64, attachments: &[Value]) -> Result<(), StoreError> {
    for att in attachments {
        let Some(id) = att.get("id").and_then(Value::as_i64) else { continue };
        conn.execute(
            "INSERT OR IGNORE INTO attachments (id, message_id, filename, url, proxy_url, size, content_type) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                message_id,
                att.get("filename").and_then(Value::as_str).unwrap_or_default(),
                att.get("url").and_then(Value::as_str).unwrap_or_default(),
                att.get("proxy_url").and_then(Value::as_str).unwrap_or_default(),
                att.get("size").and_then(Value::as_i64).unwrap_or_default(),
                att.get("content_type").and_then(Value::as_str),
            ],
        )?;
    }
    Ok(())
}

fn upsert_fts(conn: &Connection, ctx: &MessageWriteContext, message_id: i64, content: &str) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM message_fts_index WHERE message_id = ?1",
        [message_id],
    )?;
    if content.is_empty() {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO message_fts_index (content, author_name, channel_name, guild_name, message_id, channel_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![content, ctx.author_name, ctx.channel_name, ctx.guild_name, message_id, ctx.channel_id],
    )?;
    Ok(())
}

/// `add_message_snapshot` (spec §4.A.3). `msg` is the already-normalized
/// message object (author interning happens here, reference compression
/// happens here; everything else flows through `encode_object` like any
/// other kind).
pub fn add_message_snapshot(
    conn: &Connection,
    ctx: &MessageWriteContext,
    msg: &Value,
    timing: Timing,
) -> Result<AddSnapshotResult, StoreError> {
    let id = msg["id"].as_i64().expect("message id");
    let new_ts = content_timestamp(msg, timing.is_realtime());
    let existing = load_existing(conn, id)?;

    if let Some(existing) = &existing {
        if new_ts <= existing.timestamp {
            let embeds = msg.get("embeds").cloned().unwrap_or(Value::Array(vec![]));
            conn.execute(
                "UPDATE latest_message_snapshots SET embeds = ?1 WHERE id = ?2",
                params![embeds.to_string(), id],
            )?;
            return Ok(AddSnapshotResult::SameAsLatest);
        }
    }

    let author_id = match (
        msg.get("webhook_id").and_then(Value::as_i64),
        msg.get("application_id").and_then(Value::as_i64),
    ) {
        (Some(webhook_id), application_id) if Some(webhook_id) != application_id => {
            let name = msg
                .get("author")
                .and_then(|a| a.get("username"))
                .and_then(Value::as_str)
                .unwrap_or("webhook");
            let avatar = msg.get("author").and_then(|a| a.get("avatar")).and_then(Value::as_str);
            Some(intern_webhook_author(conn, webhook_id, name, avatar)?)
        }
        _ => msg.get("author").and_then(|a| a.get("id")).and_then(Value::as_i64),
    };

    let msg_ref = msg.get("message_reference");
    let ref_message_id = msg_ref.and_then(|r| r.get("message_id")).and_then(Value::as_i64);
    let ref_channel_id = compress_ref_channel(ctx, msg_ref.and_then(|r| r.get("channel_id")).and_then(Value::as_i64));
    let ref_guild_id = compress_ref_guild(ctx, msg_ref.and_then(|r| r.get("guild_id")).and_then(Value::as_i64));

    let content = msg.get("content").and_then(Value::as_str).unwrap_or_default();
    let embeds = msg.get("embeds").cloned().unwrap_or(Value::Array(vec![])).to_string();
    let created_timestamp = msg.get("timestamp").and_then(Value::as_str).unwrap_or_default();
    let edited_timestamp = msg.get("edited_timestamp").and_then(Value::as_str);
    let kind = msg.get("kind").or_else(|| msg.get("type")).and_then(Value::as_i64).unwrap_or(0);

    if let Some(attachments) = msg.get("attachments").and_then(Value::as_array) {
        write_attachments(conn, id, attachments)?;
    }
    upsert_fts(conn, ctx, id, content)?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO latest_message_snapshots \
                 (id, channel_id, guild_id, author__id, webhook_id, application_id, content, \
                  created_timestamp, edited_timestamp, embeds, message_reference__message_id, \
                  message_reference__channel_id, message_reference__guild_id, kind, _timestamp) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    id,
                    ctx.channel_id,
                    ctx.guild_id,
                    author_id,
                    msg.get("webhook_id").and_then(Value::as_i64),
                    msg.get("application_id").and_then(Value::as_i64),
                    content,
                    created_timestamp,
                    edited_timestamp,
                    embeds,
                    ref_message_id,
                    ref_channel_id,
                    ref_guild_id,
                    kind,
                    new_ts,
                ],
            )?;
            Ok(AddSnapshotResult::AddedFirst)
        }
        Some(existing) => {
            conn.execute(
                "INSERT INTO previous_message_snapshots \
                 (id, channel_id, guild_id, author__id, webhook_id, application_id, content, \
                  created_timestamp, edited_timestamp, embeds, message_reference__message_id, \
                  message_reference__channel_id, message_reference__guild_id, kind, _extra, _timestamp) \
                 SELECT id, channel_id, guild_id, author__id, webhook_id, application_id, content, \
                  created_timestamp, edited_timestamp, embeds, message_reference__message_id, \
                  message_reference__channel_id, message_reference__guild_id, kind, _extra, _timestamp \
                 FROM latest_message_snapshots WHERE id = ?1",
                [id],
            )?;
            let _ = existing.timestamp;
            conn.execute(
                "UPDATE latest_message_snapshots SET channel_id=?2, guild_id=?3, author__id=?4, \
                 webhook_id=?5, application_id=?6, content=?7, created_timestamp=?8, \
                 edited_timestamp=?9, embeds=?10, message_reference__message_id=?11, \
                 message_reference__channel_id=?12, message_reference__guild_id=?13, kind=?14, \
                 _timestamp=?15 WHERE id=?1",
                params![
                    id,
                    ctx.channel_id,
                    ctx.guild_id,
                    author_id,
                    msg.get("webhook_id").and_then(Value::as_i64),
                    msg.get("application_id").and_then(Value::as_i64),
                    content,
                    created_timestamp,
                    edited_timestamp,
                    embeds,
                    ref_message_id,
                    ref_channel_id,
                    ref_guild_id,
                    kind,
                    new_ts,
                ],
            )?;
            Ok(AddSnapshotResult::AddedAnother)
        }
    }
}

/// The highest stored message id for a channel, the cursor
/// `sync_messages` backfills forward from (spec §4.G.2).
pub fn last_message_id(conn: &Connection, channel_id: i64) -> Result<Option<i64>, StoreError> {
    Ok(conn.query_row(
        "SELECT max(id) FROM latest_message_snapshots WHERE channel_id = ?1",
        [channel_id],
        |r| r.get::<_, Option<i64>>(0),
    )?)
}

pub fn mark_message_as_deleted(conn: &Connection, id: i64, timing: Timing) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE latest_message_snapshots SET _deleted = ?1 WHERE id = ?2 AND _deleted IS NULL",
        params![encode_timing(timing), id],
    )?;
    if changed > 0 {
        conn.execute("DELETE FROM message_fts_index WHERE message_id = ?1", [id])?;
    }
    Ok(changed > 0)
}

/// Restores the ids compressed by [`compress_ref_channel`] /
/// [`compress_ref_guild`] for a message read back from the store.
pub fn restore_message_reference(ctx: &MessageWriteContext, stored_channel: Option<i64>, stored_guild: Option<i64>) -> (Option<i64>, Option<i64>) {
    (decompress_ref_channel(ctx, stored_channel), decompress_ref_guild(ctx, stored_guild))
}

pub fn decode_timing_of(raw: i64) -> Timing {
    decode_timing(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_in_memory;

    fn ctx() -> MessageWriteContext {
        MessageWriteContext {
            channel_id: 10,
            guild_id: Some(1),
            parent_channel_id: None,
            author_name: "alice".into(),
            channel_name: "general".into(),
            guild_name: "Guild".into(),
        }
    }

    #[test]
    fn embed_lag_update_keeps_history_empty_and_updates_embeds_in_place() {
        let conn = open_in_memory().unwrap();
        let create = serde_json::json!({
            "id": 1, "content": "a", "embeds": [], "timestamp": "2024-01-01T00:00:00Z",
            "author": {"id": 5, "username": "alice"},
        });
        let r1 = add_message_snapshot(&conn, &ctx(), &create, Timing::realtime(1000)).unwrap();
        assert_eq!(r1, AddSnapshotResult::AddedFirst);

        let update = serde_json::json!({
            "id": 1, "content": "a", "embeds": [{"title": "E"}], "timestamp": "2024-01-01T00:00:00Z",
            "author": {"id": 5, "username": "alice"},
        });
        let r2 = add_message_snapshot(&conn, &ctx(), &update, Timing::realtime(2000)).unwrap();
        assert_eq!(r2, AddSnapshotResult::SameAsLatest);

        let history: i64 = conn
            .query_row("SELECT count(*) FROM previous_message_snapshots WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(history, 0);
        let embeds: String = conn
            .query_row("SELECT embeds FROM latest_message_snapshots WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert!(embeds.contains("\"title\":\"E\""));
    }

    #[test]
    fn real_edit_with_new_edited_timestamp_adds_history_row() {
        let conn = open_in_memory().unwrap();
        let create = serde_json::json!({
            "id": 1, "content": "a", "embeds": [], "timestamp": "2024-01-01T00:00:00Z",
            "author": {"id": 5, "username": "alice"},
        });
        add_message_snapshot(&conn, &ctx(), &create, Timing::realtime(1000)).unwrap();

        let edit = serde_json::json!({
            "id": 1, "content": "b", "embeds": [], "timestamp": "2024-01-01T00:00:00Z",
            "edited_timestamp": "2024-01-01T00:05:00Z",
            "author": {"id": 5, "username": "alice"},
        });
        let result = add_message_snapshot(&conn, &ctx(), &edit, Timing::realtime(2000)).unwrap();
        assert_eq!(result, AddSnapshotResult::AddedAnother);

        let history: i64 = conn
            .query_row("SELECT count(*) FROM previous_message_snapshots WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(history, 1);
        let content: String = conn
            .query_row("SELECT content FROM latest_message_snapshots WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(content, "b");
    }

    #[test]
    fn webhook_authored_message_interns_a_surrogate_below_snowflake_range() {
        let conn = open_in_memory().unwrap();
        let msg = serde_json::json!({
            "id": 1, "content": "hi", "embeds": [], "timestamp": "2024-01-01T00:00:00Z",
            "webhook_id": 999, "author": {"id": 999, "username": "Bridge Bot"},
        });
        add_message_snapshot(&conn, &ctx(), &msg, Timing::realtime(1000)).unwrap();
        let author_id: i64 = conn
            .query_row("SELECT author__id FROM latest_message_snapshots WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert!(author_id < (1i64 << 32));
    }
}
