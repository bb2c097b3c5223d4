//! `member` is keyed by `(guild_id, user_id)` with no separate latest
//! table — "latest" is `max(_timestamp)` over `member_snapshots` (spec
//! §3.1). `sync_members` prunes members absent from a full refresh by
//! writing a tombstone snapshot rather than setting a `_deleted` column
//! (there's nowhere to set it: no latest row exists to mutate).

use archive_types::Timing;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::{decode_timing, encode_timing, AddSnapshotResult, StoreError};

#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub timing: Timing,
    pub data: Value,
}

fn latest_row(conn: &Connection, guild_id: i64, user_id: i64) -> Result<Option<(i64, Value)>, StoreError> {
    let sql = "SELECT nick, avatar, roles, joined_at, premium_since, pending, \
               communication_disabled_until, _extra, _timestamp \
               FROM member_snapshots WHERE guild_id = ?1 AND user_id = ?2 \
               ORDER BY _timestamp DESC LIMIT 1";
    let row = conn
        .query_row(sql, rusqlite::params![guild_id, user_id], |r| {
            let nick: Option<String> = r.get(0)?;
            let avatar: Option<String> = r.get(1)?;
            let roles: Option<String> = r.get(2)?;
            let joined_at: Option<String> = r.get(3)?;
            let premium_since: Option<String> = r.get(4)?;
            let pending: Option<bool> = r.get(5)?;
            let communication_disabled_until: Option<String> = r.get(6)?;
            let extra: Option<String> = r.get(7)?;
            let ts: i64 = r.get(8)?;
            Ok((nick, avatar, roles, joined_at, premium_since, pending, communication_disabled_until, extra, ts))
        })
        .optional()?;

    Ok(row.map(|(nick, avatar, roles, joined_at, premium_since, pending, cdu, extra, ts)| {
        let mut obj = serde_json::Map::new();
        obj.insert("guild_id".into(), guild_id.into());
        obj.insert("user_id".into(), user_id.into());
        obj.insert("nick".into(), nick.into());
        obj.insert("avatar".into(), avatar.into());
        obj.insert(
            "roles".into(),
            roles.and_then(|r| serde_json::from_str(&r).ok()).unwrap_or(Value::Null),
        );
        obj.insert("joined_at".into(), joined_at.into());
        obj.insert("premium_since".into(), premium_since.into());
        obj.insert("pending".into(), pending.into());
        obj.insert("communication_disabled_until".into(), cdu.into());
        if let Some(extra) = extra.and_then(|e| serde_json::from_str::<Value>(&e).ok()) {
            if let Value::Object(extra) = extra {
                for (k, v) in extra {
                    obj.insert(k, v);
                }
            }
        }
        (ts, Value::Object(obj))
    }))
}

/// `add_snapshot` for `member`. Same change-detection and ordering
/// invariants as the generic path, but appends to `member_snapshots`
/// instead of maintaining a latest row.
pub fn add_member_snapshot(
    conn: &Connection,
    guild_id: i64,
    user_id: i64,
    obj: &Value,
    timing: Timing,
    check_if_changed: bool,
) -> Result<AddSnapshotResult, StoreError> {
    let existing = latest_row(conn, guild_id, user_id)?;
    let new_ts = encode_timing(timing);

    if check_if_changed {
        if let Some((_, existing_data)) = &existing {
            if fields_equal(existing_data, obj) {
                return Ok(AddSnapshotResult::SameAsLatest);
            }
        }
    }

    if let Some((existing_ts, _)) = existing {
        if new_ts < existing_ts {
            return Err(StoreError::WriteOlderThanLatest {
                kind: archive_types::EntityKind::Member,
                id: user_id,
            });
        }
        if new_ts == existing_ts {
            return Ok(AddSnapshotResult::SameAsLatest);
        }
    }

    insert_member_row(conn, guild_id, user_id, obj, new_ts)?;
    Ok(if existing.is_none() {
        AddSnapshotResult::AddedFirst
    } else {
        AddSnapshotResult::AddedAnother
    })
}

fn fields_equal(a: &Value, b: &Value) -> bool {
    const VERSIONED: &[&str] = &[
        "nick",
        "avatar",
        "roles",
        "joined_at",
        "premium_since",
        "pending",
        "communication_disabled_until",
    ];
    VERSIONED.iter().all(|f| a.get(f).unwrap_or(&Value::Null) == b.get(f).unwrap_or(&Value::Null))
}

fn insert_member_row(conn: &Connection, guild_id: i64, user_id: i64, obj: &Value, ts: i64) -> Result<(), StoreError> {
    let roles = obj.get("roles").map(|v| v.to_string());
    conn.execute(
        "INSERT INTO member_snapshots (guild_id, user_id, nick, avatar, roles, joined_at, \
         premium_since, pending, communication_disabled_until, _timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            guild_id,
            user_id,
            obj.get("nick").and_then(|v| v.as_str()),
            obj.get("avatar").and_then(|v| v.as_str()),
            roles,
            obj.get("joined_at").and_then(|v| v.as_str()),
            obj.get("premium_since").and_then(|v| v.as_str()),
            obj.get("pending").and_then(|v| v.as_bool()),
            obj.get("communication_disabled_until").and_then(|v| v.as_str()),
            ts,
        ],
    )?;
    Ok(())
}

/// `sync_members(guild_id, present_ids, ts)` (spec §4.A): every member not
/// in `present_ids` whose latest snapshot isn't already a tombstone gets
/// one written at `ts`.
pub fn sync_members(conn: &Connection, guild_id: i64, present_ids: &[i64], ts: Timing) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT user_id FROM member_snapshots WHERE guild_id = ?1",
    )?;
    let known: Vec<i64> = stmt
        .query_map([guild_id], |r| r.get(0))?
        .collect::<Result<_, _>>()?;

    let mut written = 0;
    for user_id in known {
        if present_ids.contains(&user_id) {
            continue;
        }
        if let Some((_, data)) = latest_row(conn, guild_id, user_id)? {
            if is_tombstone(&data) {
                continue;
            }
        }
        insert_member_row(conn, guild_id, user_id, &Value::Null, encode_timing(ts))?;
        written += 1;
    }
    Ok(written)
}

fn is_tombstone(data: &Value) -> bool {
    const VERSIONED: &[&str] = &[
        "nick",
        "avatar",
        "roles",
        "joined_at",
        "premium_since",
        "pending",
        "communication_disabled_until",
    ];
    VERSIONED.iter().all(|f| data.get(f).map(Value::is_null).unwrap_or(true))
}

/// `get_snapshot_at` for `member`.
pub fn get_member_at(conn: &Connection, guild_id: i64, user_id: i64, ts: i64) -> Result<Option<MemberSnapshot>, StoreError> {
    let sql = "SELECT nick, avatar, roles, joined_at, premium_since, pending, \
               communication_disabled_until, _extra, _timestamp \
               FROM member_snapshots WHERE guild_id = ?1 AND user_id = ?2 AND _timestamp <= ?3 \
               ORDER BY _timestamp DESC LIMIT 1";
    let row = conn
        .query_row(sql, rusqlite::params![guild_id, user_id, ts], |r| {
            let nick: Option<String> = r.get(0)?;
            let avatar: Option<String> = r.get(1)?;
            let roles: Option<String> = r.get(2)?;
            let joined_at: Option<String> = r.get(3)?;
            let premium_since: Option<String> = r.get(4)?;
            let pending: Option<bool> = r.get(5)?;
            let cdu: Option<String> = r.get(6)?;
            let ts: i64 = r.get(8)?;
            Ok((nick, avatar, roles, joined_at, premium_since, pending, cdu, ts))
        })
        .optional()?;

    Ok(row.map(|(nick, avatar, roles, joined_at, premium_since, pending, cdu, ts)| {
        let data = serde_json::json!({
            "guild_id": guild_id,
            "user_id": user_id,
            "nick": nick,
            "avatar": avatar,
            "roles": roles.and_then(|r| serde_json::from_str::<Value>(&r).ok()),
            "joined_at": joined_at,
            "premium_since": premium_since,
            "pending": pending,
            "communication_disabled_until": cdu,
        });
        MemberSnapshot {
            timing: decode_timing(ts),
            data,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_in_memory;

    #[test]
    fn member_removal_writes_all_null_tombstone() {
        let conn = open_in_memory().unwrap();
        add_member_snapshot(
            &conn,
            100,
            7,
            &serde_json::json!({"nick": "bob", "roles": [1, 2]}),
            Timing::realtime(1000),
            true,
        )
        .unwrap();
        sync_members(&conn, 100, &[], Timing::realtime(2000)).unwrap();

        let at_now = get_member_at(&conn, 100, 7, encode_timing(Timing::MAX)).unwrap().unwrap();
        assert!(is_tombstone(&at_now.data));
    }

    #[test]
    fn member_present_in_refresh_keeps_latest() {
        let conn = open_in_memory().unwrap();
        add_member_snapshot(
            &conn,
            100,
            7,
            &serde_json::json!({"nick": "bob"}),
            Timing::realtime(1000),
            true,
        )
        .unwrap();
        let written = sync_members(&conn, 100, &[7], Timing::realtime(2000)).unwrap();
        assert_eq!(written, 0);
    }
}
