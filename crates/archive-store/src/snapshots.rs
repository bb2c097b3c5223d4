//! Generic `add_snapshot` / `get_snapshot_at` / `children_at` /
//! `sync_deletions` / `mark_as_deleted` for the seven entity kinds keyed by
//! a single snowflake id (spec §4.A). `member` and `message` have their
//! own modules: member because it's keyed by `(guild_id, user_id)` with no
//! latest table, message because of the embed-lag special case (§4.A.3).

use std::collections::BTreeMap;

use archive_types::{EntityKind, Timing};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use crate::encode::{decode_object, encode_fields, fixed_columns};
use crate::{decode_timing, encode_timing, AddSnapshotOptions, AddSnapshotResult, StoreError};

fn table_names(kind: EntityKind) -> (String, String) {
    let frag = kind.table_fragment();
    (format!("latest_{frag}_snapshots"), format!("previous_{frag}_snapshots"))
}

/// The column children are grouped under for `children_at` / `sync_deletions`.
pub fn parent_column(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Role | EntityKind::Channel | EntityKind::GuildEmoji => "guild_id",
        EntityKind::Thread => "parent_id",
        EntityKind::ForumTag => "channel_id",
        other => panic!("{other:?} has no parent column"),
    }
}

struct Latest {
    fields: BTreeMap<String, SqlValue>,
    timestamp: i64,
    extra: Option<String>,
}

fn load_latest(conn: &Connection, table: &str, id: i64) -> Result<Option<Latest>, StoreError> {
    let sql = format!("SELECT * FROM {table} WHERE id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    let row = stmt
        .query_row([id], |row| {
            let mut fields = BTreeMap::new();
            let mut timestamp = 0i64;
            let mut extra = None;
            for i in 0..row.column_count() {
                let name = row.column_name(i)?.to_string();
                let value: SqlValue = row.get(i)?;
                match name.as_str() {
                    "_timestamp" => {
                        if let SqlValue::Integer(ts) = value {
                            timestamp = ts;
                        }
                    }
                    "_extra" => {
                        if let SqlValue::Text(s) = value {
                            extra = Some(s);
                        }
                    }
                    "_deleted" => {}
                    _ => {
                        fields.insert(name, value);
                    }
                }
            }
            Ok(Latest {
                fields,
                timestamp,
                extra,
            })
        })
        .optional()?;
    Ok(row)
}

/// `add_snapshot` for single-id-keyed kinds (spec §4.A).
pub fn add_snapshot(
    conn: &Connection,
    kind: EntityKind,
    id: i64,
    obj: &Value,
    timing: Timing,
    opts: AddSnapshotOptions,
) -> Result<AddSnapshotResult, StoreError> {
    let (latest_table, history_table) = table_names(kind);
    let existing = load_latest(conn, &latest_table, id)?;

    let (mut fields, mut extra) = encode_fields(kind, obj);
    fields.insert("id".to_string(), Some(SqlValue::Integer(id)));

    if opts.partial {
        if let Some(prev) = &existing {
            for (col, val) in fields.iter_mut() {
                if val.is_none() {
                    *val = prev.fields.get(col).cloned();
                }
            }
            if extra.is_none() {
                extra = prev.extra.clone();
            }
        }
        if fields.values().any(Option::is_none) {
            return Ok(AddSnapshotResult::PartialNoSnapshot);
        }
    }

    let finalized: BTreeMap<String, SqlValue> = fields
        .into_iter()
        .map(|(k, v)| (k, v.unwrap_or(SqlValue::Null)))
        .collect();

    if opts.check_if_changed {
        if let Some(prev) = &existing {
            if prev.fields == finalized && prev.extra == extra {
                return Ok(AddSnapshotResult::SameAsLatest);
            }
        }
    }

    let new_ts = encode_timing(timing);
    let cols = fixed_columns(kind);

    match existing {
        None => {
            insert_latest(conn, &latest_table, cols, &finalized, &extra, new_ts)?;
            Ok(AddSnapshotResult::AddedFirst)
        }
        Some(prev) => {
            if new_ts < prev.timestamp {
                return Err(StoreError::WriteOlderThanLatest { kind, id });
            }
            if new_ts == prev.timestamp {
                return Ok(AddSnapshotResult::SameAsLatest);
            }
            archive_latest_into_history(conn, &history_table, cols, &prev)?;
            update_latest(conn, &latest_table, cols, &finalized, &extra, new_ts, id)?;
            Ok(AddSnapshotResult::AddedAnother)
        }
    }
}

fn insert_latest(
    conn: &Connection,
    table: &str,
    cols: &[&str],
    fields: &BTreeMap<String, SqlValue>,
    extra: &Option<String>,
    ts: i64,
) -> Result<(), StoreError> {
    let mut col_list: Vec<&str> = cols.to_vec();
    col_list.push("_extra");
    col_list.push("_timestamp");
    let placeholders: Vec<String> = (1..=col_list.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        col_list.join(", "),
        placeholders.join(", ")
    );
    let mut params: Vec<SqlValue> = cols.iter().map(|c| fields.get(*c).cloned().unwrap_or(SqlValue::Null)).collect();
    params.push(extra.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null));
    params.push(SqlValue::Integer(ts));
    conn.prepare_cached(&sql)?.execute(params_from_iter(params))?;
    Ok(())
}

fn update_latest(
    conn: &Connection,
    table: &str,
    cols: &[&str],
    fields: &BTreeMap<String, SqlValue>,
    extra: &Option<String>,
    ts: i64,
    id: i64,
) -> Result<(), StoreError> {
    let assignments: Vec<String> = cols
        .iter()
        .filter(|c| **c != "id")
        .enumerate()
        .map(|(i, c)| format!("{c} = ?{}", i + 1))
        .collect();
    let sql = format!(
        "UPDATE {table} SET {}, _extra = ?{}, _timestamp = ?{} WHERE id = ?{}",
        assignments.join(", "),
        assignments.len() + 1,
        assignments.len() + 2,
        assignments.len() + 3,
    );
    let mut params: Vec<SqlValue> = cols
        .iter()
        .filter(|c| **c != "id")
        .map(|c| fields.get(*c).cloned().unwrap_or(SqlValue::Null))
        .collect();
    params.push(extra.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null));
    params.push(SqlValue::Integer(ts));
    params.push(SqlValue::Integer(id));
    conn.prepare_cached(&sql)?.execute(params_from_iter(params))?;
    Ok(())
}

fn archive_latest_into_history(conn: &Connection, history_table: &str, cols: &[&str], prev: &Latest) -> Result<(), StoreError> {
    let mut col_list: Vec<&str> = cols.to_vec();
    col_list.push("_extra");
    col_list.push("_timestamp");
    let placeholders: Vec<String> = (1..=col_list.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {history_table} ({}) VALUES ({})",
        col_list.join(", "),
        placeholders.join(", ")
    );
    let mut params: Vec<SqlValue> = cols
        .iter()
        .map(|c| prev.fields.get(*c).cloned().unwrap_or(SqlValue::Null))
        .collect();
    params.push(prev.extra.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null));
    params.push(SqlValue::Integer(prev.timestamp));
    conn.prepare_cached(&sql)?.execute(params_from_iter(params))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SnapshotAt {
    pub timing: Timing,
    pub deleted_timing: Option<Timing>,
    pub data: Value,
}

pub fn mark_as_deleted(conn: &Connection, kind: EntityKind, id: i64, timing: Timing) -> Result<bool, StoreError> {
    let (latest_table, _) = table_names(kind);
    let sql = format!("UPDATE {latest_table} SET _deleted = ?1 WHERE id = ?2 AND _deleted IS NULL");
    let changed = conn
        .prepare_cached(&sql)?
        .execute(rusqlite::params![encode_timing(timing), id])?;
    Ok(changed > 0)
}

/// `get_snapshot_at(kind, id, ts)` (spec §4.A). Looks at the latest row
/// first; falls back to the newest history row at or before `ts`.
pub fn get_snapshot_at(conn: &Connection, kind: EntityKind, id: i64, ts: i64) -> Result<Option<SnapshotAt>, StoreError> {
    let (latest_table, history_table) = table_names(kind);

    let latest = load_latest(conn, &latest_table, id)?;
    let deleted_timing = {
        let sql = format!("SELECT _deleted FROM {latest_table} WHERE id = ?1");
        let deleted: Option<i64> = conn
            .query_row(&sql, [id], |row| row.get::<_, Option<i64>>(0))
            .optional()?
            .flatten();
        deleted
            .filter(|&d| d <= ts)
            .map(decode_timing)
    };

    if let Some(row) = &latest {
        if row.timestamp <= ts {
            let data = decode_object(kind, &row.fields, row.extra.as_deref());
            return Ok(Some(SnapshotAt {
                timing: decode_timing(row.timestamp),
                deleted_timing,
                data,
            }));
        }
    }

    let sql = format!(
        "SELECT * FROM {history_table} WHERE id = ?1 AND _timestamp <= ?2 ORDER BY _timestamp DESC LIMIT 1"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let row = stmt
        .query_row(rusqlite::params![id, ts], |row| {
            let mut fields = BTreeMap::new();
            let mut timestamp = 0i64;
            let mut extra = None;
            for i in 0..row.column_count() {
                let name = row.column_name(i)?.to_string();
                let value: SqlValue = row.get(i)?;
                match name.as_str() {
                    "_timestamp" => {
                        if let SqlValue::Integer(t) = value {
                            timestamp = t;
                        }
                    }
                    "_extra" => {
                        if let SqlValue::Text(s) = value {
                            extra = Some(s);
                        }
                    }
                    _ => {
                        fields.insert(name, value);
                    }
                }
            }
            Ok((fields, timestamp, extra))
        })
        .optional()?;

    Ok(row.map(|(fields, timestamp, extra)| SnapshotAt {
        timing: decode_timing(timestamp),
        deleted_timing,
        data: decode_object(kind, &fields, extra.as_deref()),
    }))
}

/// `children_at(kind, parent_id, ts)` (spec §4.A). Reads the latest table
/// directly rather than reconstructing each child's state as-of `ts` from
/// history — adequate for the controller's actual call sites (initial
/// bring-up and `sync_deletions`, both querying "now").
pub fn children_at(conn: &Connection, kind: EntityKind, parent_id: i64, ts: i64) -> Result<Vec<(i64, SnapshotAt)>, StoreError> {
    let (latest_table, _) = table_names(kind);
    let parent_col = parent_column(kind);
    let sql = format!("SELECT * FROM {latest_table} WHERE {parent_col} = ?1 AND _timestamp <= ?2");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(rusqlite::params![parent_id, ts], |row| {
        let mut fields = BTreeMap::new();
        let mut id = 0i64;
        let mut timestamp = 0i64;
        let mut extra = None;
        let mut deleted: Option<i64> = None;
        for i in 0..row.column_count() {
            let name = row.column_name(i)?.to_string();
            let value: SqlValue = row.get(i)?;
            match name.as_str() {
                "id" => {
                    if let SqlValue::Integer(v) = &value {
                        id = *v;
                    }
                    fields.insert(name, value);
                }
                "_timestamp" => {
                    if let SqlValue::Integer(t) = value {
                        timestamp = t;
                    }
                }
                "_deleted" => {
                    if let SqlValue::Integer(d) = value {
                        deleted = Some(d);
                    }
                }
                "_extra" => {
                    if let SqlValue::Text(s) = value {
                        extra = Some(s);
                    }
                }
                _ => {
                    fields.insert(name, value);
                }
            }
        }
        Ok((id, fields, timestamp, extra, deleted))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (id, fields, timestamp, extra, deleted) = row?;
        out.push((
            id,
            SnapshotAt {
                timing: decode_timing(timestamp),
                deleted_timing: deleted.map(decode_timing),
                data: decode_object(kind, &fields, extra.as_deref()),
            },
        ));
    }
    Ok(out)
}

/// `sync_deletions(kind, parent_id, present_ids, ts)` (spec §4.A): marks
/// every non-deleted child of `parent_id` absent from `present_ids` as
/// deleted at `ts`.
pub fn sync_deletions(
    conn: &Connection,
    kind: EntityKind,
    parent_id: i64,
    present_ids: &[i64],
    ts: Timing,
) -> Result<usize, StoreError> {
    let (latest_table, _) = table_names(kind);
    let parent_col = parent_column(kind);

    if present_ids.is_empty() {
        let sql = format!("UPDATE {latest_table} SET _deleted = ?1 WHERE {parent_col} = ?2 AND _deleted IS NULL");
        let changed = conn
            .prepare_cached(&sql)?
            .execute(rusqlite::params![encode_timing(ts), parent_id])?;
        return Ok(changed);
    }

    let placeholders: Vec<String> = (1..=present_ids.len()).map(|i| format!("?{}", i + 2)).collect();
    let sql = format!(
        "UPDATE {latest_table} SET _deleted = ?1 WHERE {parent_col} = ?2 AND _deleted IS NULL AND id NOT IN ({})",
        placeholders.join(", ")
    );
    let mut params: Vec<SqlValue> = vec![SqlValue::Integer(encode_timing(ts)), SqlValue::Integer(parent_id)];
    params.extend(present_ids.iter().map(|id| SqlValue::Integer(*id)));
    let changed = conn.prepare_cached(&sql)?.execute(params_from_iter(params))?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_in_memory;

    fn guild_json(id: i64, name: &str, owner: i64) -> Value {
        serde_json::json!({"id": id, "name": name, "owner_id": owner, "icon": null})
    }

    #[test]
    fn repeated_identical_write_is_same_as_latest() {
        let conn = open_in_memory().unwrap();
        let obj = guild_json(1, "Guild", 9);
        let t1 = Timing::realtime(1000);
        let r1 = add_snapshot(&conn, EntityKind::Guild, 1, &obj, t1, AddSnapshotOptions::new()).unwrap();
        assert_eq!(r1, AddSnapshotResult::AddedFirst);
        let t2 = Timing::realtime(2000);
        let r2 = add_snapshot(&conn, EntityKind::Guild, 1, &obj, t2, AddSnapshotOptions::new()).unwrap();
        assert_eq!(r2, AddSnapshotResult::SameAsLatest);
    }

    #[test]
    fn changed_content_with_later_timestamp_adds_history_row() {
        let conn = open_in_memory().unwrap();
        let t1 = Timing::realtime(1000);
        add_snapshot(
            &conn,
            EntityKind::Guild,
            1,
            &guild_json(1, "Old", 9),
            t1,
            AddSnapshotOptions::new(),
        )
        .unwrap();
        let t2 = Timing::realtime(2000);
        let result = add_snapshot(
            &conn,
            EntityKind::Guild,
            1,
            &guild_json(1, "New", 9),
            t2,
            AddSnapshotOptions::new(),
        )
        .unwrap();
        assert_eq!(result, AddSnapshotResult::AddedAnother);

        let count: i64 = conn
            .query_row("SELECT count(*) FROM previous_guild_snapshots WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let name: String = conn
            .query_row("SELECT name FROM latest_guild_snapshots WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "New");
    }

    #[test]
    fn write_older_than_latest_with_different_content_errors() {
        let conn = open_in_memory().unwrap();
        add_snapshot(
            &conn,
            EntityKind::Guild,
            1,
            &guild_json(1, "New", 9),
            Timing::realtime(5000),
            AddSnapshotOptions::new(),
        )
        .unwrap();
        let err = add_snapshot(
            &conn,
            EntityKind::Guild,
            1,
            &guild_json(1, "Older", 9),
            Timing::realtime(1000),
            AddSnapshotOptions::new(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::WriteOlderThanLatest { .. }));
    }

    #[test]
    fn get_snapshot_at_falls_back_to_history() {
        let conn = open_in_memory().unwrap();
        add_snapshot(
            &conn,
            EntityKind::Guild,
            1,
            &guild_json(1, "First", 9),
            Timing::realtime(1000),
            AddSnapshotOptions::new(),
        )
        .unwrap();
        add_snapshot(
            &conn,
            EntityKind::Guild,
            1,
            &guild_json(1, "Second", 9),
            Timing::realtime(3000),
            AddSnapshotOptions::new(),
        )
        .unwrap();

        let at_now = get_snapshot_at(&conn, EntityKind::Guild, 1, encode_timing(Timing::MAX))
            .unwrap()
            .unwrap();
        assert_eq!(at_now.data["name"], "Second");

        let at_mid = get_snapshot_at(&conn, EntityKind::Guild, 1, encode_timing(Timing::realtime(2000)))
            .unwrap()
            .unwrap();
        assert_eq!(at_mid.data["name"], "First");
    }

    #[test]
    fn sync_deletions_marks_absent_children_deleted() {
        let conn = open_in_memory().unwrap();
        for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
            let obj = serde_json::json!({"id": id, "guild_id": 100, "kind": 0, "name": name});
            add_snapshot(&conn, EntityKind::Channel, id, &obj, Timing::realtime(1000), AddSnapshotOptions::new()).unwrap();
        }
        let changed = sync_deletions(&conn, EntityKind::Channel, 100, &[1, 3], Timing::realtime(2000)).unwrap();
        assert_eq!(changed, 1);

        let deleted: Option<i64> = conn
            .query_row("SELECT _deleted FROM latest_channel_snapshots WHERE id = 2", [], |r| r.get(0))
            .unwrap();
        assert_eq!(deleted, Some(encode_timing(Timing::realtime(2000))));
        let untouched: Option<i64> = conn
            .query_row("SELECT _deleted FROM latest_channel_snapshots WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(untouched, None);
    }
}
