//! `encode_object` / `decode_object` (spec §4.A "Encoding contract").
//!
//! Entity values arrive and leave as [`serde_json::Value`]; the store only
//! ever sees flat rows. Nested objects are flattened with `__` as path
//! separator (`primary_guild.tag` → `primary_guild__tag`); arrays are kept
//! as compact JSON-text leaves rather than flattened element-wise, which is
//! how `permission_overwrites` and friends get their "compact array"
//! encoding. Anything present in the JSON that isn't one of a kind's fixed
//! columns is carried through in an `_extra` JSON blob so forward-compatible
//! fields are never silently dropped.

use std::collections::BTreeMap;

use archive_types::EntityKind;
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};

/// A flattened row: column name → SQL value, ready to bind into a prepared
/// statement. `_extra` and `_timestamp` / `_deleted` are added by the
/// caller, not by `encode_object` itself.
pub type Row = BTreeMap<String, SqlValue>;

/// The fixed, versioned+object-scope columns for one entity kind, plus
/// which of those columns hold a JSON-array-encoded leaf (so decode knows
/// to parse them back into an array rather than leave them as plain text).
struct Columns {
    fixed: &'static [&'static str],
    array_valued: &'static [&'static str],
}

fn columns_for(kind: EntityKind) -> Columns {
    match kind {
        EntityKind::User => Columns {
            fixed: &[
                "id",
                "username",
                "discriminator",
                "global_name",
                "avatar",
                "bot",
                "kind",
                "primary_guild__identity_guild_id",
                "primary_guild__identity_enabled",
                "primary_guild__tag",
                "primary_guild__badge",
                "collectibles__nameplate",
            ],
            array_valued: &[],
        },
        EntityKind::Guild => Columns {
            fixed: &["id", "name", "icon", "owner_id"],
            array_valued: &[],
        },
        EntityKind::Role => Columns {
            fixed: &[
                "id",
                "guild_id",
                "name",
                "color",
                "hoist",
                "position",
                "permissions",
                "managed",
                "mentionable",
                "tags__bot_id",
                "tags__premium_subscriber",
            ],
            array_valued: &[],
        },
        EntityKind::Member => Columns {
            fixed: &[
                "guild_id",
                "user_id",
                "nick",
                "avatar",
                "roles",
                "joined_at",
                "premium_since",
                "pending",
                "communication_disabled_until",
            ],
            array_valued: &["roles"],
        },
        EntityKind::Channel => Columns {
            fixed: &[
                "id",
                "guild_id",
                "kind",
                "name",
                "topic",
                "nsfw",
                "position",
                "parent_id",
                "bitrate",
                "rate_limit_per_user",
                "permission_overwrites",
                "available_tags",
            ],
            array_valued: &["permission_overwrites", "available_tags"],
        },
        EntityKind::Thread => Columns {
            fixed: &[
                "id",
                "guild_id",
                "kind",
                "name",
                "parent_id",
                "owner_id",
                "message_count",
                "member_count",
                "rate_limit_per_user",
                "thread_metadata__archived",
                "thread_metadata__auto_archive_duration",
                "thread_metadata__archive_timestamp",
                "thread_metadata__locked",
                "thread_metadata__invitable",
                "applied_tags",
            ],
            array_valued: &["applied_tags"],
        },
        EntityKind::ForumTag => Columns {
            fixed: &["id", "channel_id", "name", "moderated", "emoji_id", "emoji_name"],
            array_valued: &[],
        },
        EntityKind::Message => Columns {
            fixed: &[
                "id",
                "channel_id",
                "guild_id",
                "author__id",
                "webhook_id",
                "application_id",
                "content",
                "created_timestamp",
                "edited_timestamp",
                "embeds",
                "message_reference__message_id",
                "message_reference__channel_id",
                "message_reference__guild_id",
                "kind",
            ],
            array_valued: &["embeds"],
        },
        EntityKind::GuildEmoji => Columns {
            fixed: &["id", "guild_id", "name", "animated", "available", "roles"],
            array_valued: &["roles"],
        },
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}__{k}")
                };
                flatten(&path, v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(u) = n.as_u64() {
                SqlValue::Integer(u as i64)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// The fixed, versioned+object-scope column names for `kind`, in the order
/// `schema.sql` declares them. Exposed so callers can build column lists
/// for prepared `INSERT`/`SELECT` statements without duplicating the list.
pub fn fixed_columns(kind: EntityKind) -> &'static [&'static str] {
    columns_for(kind).fixed
}

/// Flattens `value`, keeping track of which fixed columns were actually
/// present in the source object (`Some`) versus absent (`None`) — the
/// distinction `add_snapshot`'s `partial` mode needs to decide whether to
/// fill a column from the latest snapshot (spec §4.A). Fields not in the
/// fixed set are rolled into a `_extra` JSON blob.
pub fn encode_fields(kind: EntityKind, value: &Value) -> (BTreeMap<String, Option<SqlValue>>, Option<String>) {
    let cols = columns_for(kind);
    let mut flat = Map::new();
    flatten("", value, &mut flat);

    let mut fields = BTreeMap::new();
    let mut extra = Map::new();
    for (key, v) in flat {
        if cols.fixed.contains(&key.as_str()) {
            fields.insert(key, Some(json_to_sql(&v)));
        } else if key != "_extra" {
            extra.insert(key, v);
        }
    }
    for &col in cols.fixed {
        fields.entry(col.to_string()).or_insert(None);
    }

    let extra_blob = if extra.is_empty() {
        None
    } else {
        Some(Value::Object(extra).to_string())
    };
    (fields, extra_blob)
}

/// Flattens `value` into fixed columns for `kind`, with everything not in
/// the fixed set rolled into a `_extra` JSON blob. Returns the row and the
/// extra blob separately since callers bind them differently (the extra
/// blob is always a single `_extra` column). Absent fixed columns encode
/// as SQL `NULL`; use [`encode_fields`] when absent-vs-null matters.
pub fn encode_object(kind: EntityKind, value: &Value) -> (Row, Option<String>) {
    let (fields, extra_blob) = encode_fields(kind, value);
    let row = fields
        .into_iter()
        .map(|(k, v)| (k, v.unwrap_or(SqlValue::Null)))
        .collect();
    (row, extra_blob)
}

fn unflatten_into(root: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split("__");
    let first = parts.next().unwrap();
    match parts.clone().next() {
        None => {
            root.insert(first.to_string(), value);
        }
        Some(_) => {
            let rest = path[first.len() + 2..].to_string();
            let entry = root
                .entry(first.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(ref mut nested) = entry {
                unflatten_into(nested, &rest, value);
            }
        }
    }
}

/// Inverse of [`encode_object`]: reconstructs a JSON value from a row's
/// fixed columns plus its `_extra` blob (if any).
pub fn decode_object(kind: EntityKind, row: &BTreeMap<String, SqlValue>, extra_blob: Option<&str>) -> Value {
    let cols = columns_for(kind);
    let mut root = Map::new();
    for &col in cols.fixed {
        let Some(sql_value) = row.get(col) else { continue };
        let value = match sql_value {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) => Value::from(*i),
            SqlValue::Real(f) => Value::from(*f),
            SqlValue::Text(s) => {
                if cols.array_valued.contains(&col) {
                    serde_json::from_str(s).unwrap_or(Value::Null)
                } else {
                    Value::String(s.clone())
                }
            }
            SqlValue::Blob(b) => Value::String(hex::encode(b)),
        };
        unflatten_into(&mut root, col, value);
    }
    if let Some(blob) = extra_blob {
        if let Ok(Value::Object(extra)) = serde_json::from_str(blob) {
            for (k, v) in extra {
                unflatten_into(&mut root, &k, v);
            }
        }
    }
    Value::Object(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_roundtrips_fixed_fields() {
        let guild = serde_json::json!({
            "id": 42,
            "name": "Test Guild",
            "icon": null,
            "owner_id": 7,
        });
        let (row, extra) = encode_object(EntityKind::Guild, &guild);
        let decoded = decode_object(EntityKind::Guild, &row, extra.as_deref());
        assert_eq!(decoded["id"], 42);
        assert_eq!(decoded["name"], "Test Guild");
        assert_eq!(decoded["owner_id"], 7);
    }

    #[test]
    fn nested_fields_flatten_with_double_underscore() {
        let user = serde_json::json!({
            "id": 1,
            "username": "a",
            "discriminator": "0",
            "primary_guild": {"tag": "ABC", "identity_enabled": true},
        });
        let (row, _) = encode_object(EntityKind::User, &user);
        assert_eq!(row.get("primary_guild__tag"), Some(&SqlValue::Text("ABC".into())));
        assert_eq!(row.get("primary_guild__identity_enabled"), Some(&SqlValue::Integer(1)));
    }

    #[test]
    fn unknown_fields_are_preserved_in_extra() {
        let guild = serde_json::json!({
            "id": 1,
            "name": "g",
            "owner_id": 1,
            "icon": null,
            "vanity_url_code": "my-guild",
        });
        let (row, extra) = encode_object(EntityKind::Guild, &guild);
        assert!(!row.contains_key("vanity_url_code"));
        let extra = extra.expect("extra blob present");
        let decoded = decode_object(EntityKind::Guild, &row, Some(&extra));
        assert_eq!(decoded["vanity_url_code"], "my-guild");
    }

    #[test]
    fn array_valued_columns_round_trip_as_json() {
        let channel = serde_json::json!({
            "id": 1,
            "kind": 0,
            "permission_overwrites": [{"id": 2, "type": 0, "allow": "0", "deny": "0"}],
        });
        let (row, _) = encode_object(EntityKind::Channel, &channel);
        let decoded = decode_object(EntityKind::Channel, &row, None);
        assert_eq!(decoded["permission_overwrites"][0]["id"], 2);
    }
}
