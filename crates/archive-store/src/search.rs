//! `search_messages(query, start_delim, end_delim)` (spec §4.A): a lazy
//! cursor over the FTS index, highlighting matches and joining the
//! denormalized author/channel/guild names that were written alongside
//! each message (spec §3, "FTS" supplement).

use rusqlite::Connection;

use crate::StoreError;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub message_id: i64,
    pub channel_id: i64,
    pub highlighted_content: String,
    pub author_name: String,
    pub channel_name: String,
    pub guild_name: String,
}

/// Returns up to `limit` hits after `offset`, ordered by FTS rank — the
/// paging shape `children_at` also uses, so a caller can drive this as a
/// cursor by repeatedly bumping `offset`.
pub fn search_messages(
    conn: &Connection,
    query: &str,
    start_delim: &str,
    end_delim: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<SearchHit>, StoreError> {
    let sql = "SELECT message_id, channel_id, \
               snippet(message_fts_index, 0, ?2, ?3, '...', 24), \
               author_name, channel_name, guild_name \
               FROM message_fts_index WHERE message_fts_index MATCH ?1 \
               ORDER BY rank LIMIT ?4 OFFSET ?5";
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(rusqlite::params![query, start_delim, end_delim, limit, offset], |row| {
        Ok(SearchHit {
            message_id: row.get(0)?,
            channel_id: row.get(1)?,
            highlighted_content: row.get(2)?,
            author_name: row.get(3)?,
            channel_name: row.get(4)?,
            guild_name: row.get(5)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_in_memory;

    #[test]
    fn search_highlights_matching_term() {
        let conn = open_in_memory().unwrap();
        conn.execute(
            "INSERT INTO message_fts_index (content, author_name, channel_name, guild_name, message_id, channel_id) \
             VALUES ('the quick brown fox', 'alice', 'general', 'Guild', 1, 10)",
            [],
        )
        .unwrap();
        let hits = search_messages(&conn, "quick", "[", "]", 10, 0).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].highlighted_content.contains("[quick]"));
    }
}
