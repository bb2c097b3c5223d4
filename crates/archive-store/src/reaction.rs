//! Reaction placements (spec §3.1): a user's reaction on a message is
//! interval-valued, present from `start_timestamp` until `end_timestamp`
//! (null while still present), rather than versioned like other entities.

use archive_types::Timing;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{encode_timing, StoreError};

fn upsert_emoji(conn: &Connection, emoji_key: &str, emoji_id: Option<i64>, name: Option<&str>) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO reaction_emojis (emoji_key, id, name) VALUES (?1, ?2, ?3) \
         ON CONFLICT (emoji_key) DO UPDATE SET id = excluded.id, name = excluded.name",
        params![emoji_key, emoji_id, name],
    )?;
    Ok(())
}

/// `MESSAGE_REACTION_ADD` (spec §4.G.4). A no-op if the user already has an
/// open placement for this emoji on this message — reconnect replay and
/// duplicate gateway events must not open a second interval.
pub fn add_reaction_placement(
    conn: &Connection,
    message_id: i64,
    emoji_key: &str,
    emoji_id: Option<i64>,
    emoji_name: Option<&str>,
    burst: bool,
    user_id: i64,
    timing: Timing,
) -> Result<bool, StoreError> {
    upsert_emoji(conn, emoji_key, emoji_id, emoji_name)?;

    let open: Option<i64> = conn
        .query_row(
            "SELECT rowid FROM reactions WHERE message_id = ?1 AND emoji_key = ?2 AND user_id = ?3 AND end_timestamp IS NULL",
            params![message_id, emoji_key, user_id],
            |r| r.get(0),
        )
        .optional()?;
    if open.is_some() {
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO reactions (message_id, emoji_key, kind, user_id, start_timestamp, end_timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
        params![message_id, emoji_key, burst as i64, user_id, encode_timing(timing)],
    )?;
    Ok(true)
}

/// `MESSAGE_REACTION_REMOVE` — closes the one open placement for this user
/// and emoji on this message.
pub fn mark_reaction_as_removed(conn: &Connection, message_id: i64, emoji_key: &str, user_id: i64, timing: Timing) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE reactions SET end_timestamp = ?1 \
         WHERE message_id = ?2 AND emoji_key = ?3 AND user_id = ?4 AND end_timestamp IS NULL",
        params![encode_timing(timing), message_id, emoji_key, user_id],
    )?;
    Ok(changed > 0)
}

/// `MESSAGE_REACTION_REMOVE_EMOJI` / `MESSAGE_REACTION_REMOVE_ALL` — closes
/// every open placement on the message, optionally restricted to one emoji
/// (`None` closes all of them, matching `REMOVE_ALL`'s "wipe the message"
/// semantics).
pub fn mark_reactions_as_removed_bulk(conn: &Connection, message_id: i64, emoji_key: Option<&str>, timing: Timing) -> Result<usize, StoreError> {
    let changed = match emoji_key {
        Some(emoji_key) => conn.execute(
            "UPDATE reactions SET end_timestamp = ?1 WHERE message_id = ?2 AND emoji_key = ?3 AND end_timestamp IS NULL",
            params![encode_timing(timing), message_id, emoji_key],
        )?,
        None => conn.execute(
            "UPDATE reactions SET end_timestamp = ?1 WHERE message_id = ?2 AND end_timestamp IS NULL",
            params![encode_timing(timing), message_id],
        )?,
    };
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_in_memory;

    #[test]
    fn adding_the_same_reaction_twice_does_not_open_a_second_interval() {
        let conn = open_in_memory().unwrap();
        let added = add_reaction_placement(&conn, 1, "👍", None, Some("👍"), false, 5, Timing::realtime(1000)).unwrap();
        assert!(added);
        let added_again = add_reaction_placement(&conn, 1, "👍", None, Some("👍"), false, 5, Timing::realtime(2000)).unwrap();
        assert!(!added_again);

        let count: i64 = conn.query_row("SELECT count(*) FROM reactions WHERE message_id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn remove_closes_only_the_matching_users_interval() {
        let conn = open_in_memory().unwrap();
        add_reaction_placement(&conn, 1, "👍", None, Some("👍"), false, 5, Timing::realtime(1000)).unwrap();
        add_reaction_placement(&conn, 1, "👍", None, Some("👍"), false, 6, Timing::realtime(1000)).unwrap();

        let removed = mark_reaction_as_removed(&conn, 1, "👍", 5, Timing::realtime(2000)).unwrap();
        assert!(removed);

        let open: i64 = conn
            .query_row("SELECT count(*) FROM reactions WHERE message_id = 1 AND end_timestamp IS NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(open, 1);
    }

    #[test]
    fn remove_all_closes_every_open_interval_on_the_message() {
        let conn = open_in_memory().unwrap();
        add_reaction_placement(&conn, 1, "👍", None, Some("👍"), false, 5, Timing::realtime(1000)).unwrap();
        add_reaction_placement(&conn, 1, "🎉", None, Some("🎉"), false, 6, Timing::realtime(1000)).unwrap();

        let closed = mark_reactions_as_removed_bulk(&conn, 1, None, Timing::realtime(2000)).unwrap();
        assert_eq!(closed, 2);
    }
}
