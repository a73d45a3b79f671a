//! Message upsert and query operations.

use crate::error::StoreResult;
use crate::model::{BatchUpsertOutcome, Message, UpsertOutcome};
use crate::Store;
use rusqlite::{params, OptionalExtension, Row};

const MAX_SEARCH_LIMIT: i64 = 500;

impl Store {
    /// Insert or update a single message.
    ///
    /// Primary key is `message_id` when non-empty, else `client_msg_id`. A
    /// row previously keyed only by `client_msg_id` migrates to also carry
    /// `message_id` once the server assigns one (same row, new key).
    pub fn save_message(&self, m: &Message) -> StoreResult<UpsertOutcome> {
        let conn = self.lock();
        save_message_tx(&conn, m)
    }

    /// Insert or update a batch of messages in a single transaction.
    pub fn save_messages(&self, ms: &[Message]) -> StoreResult<BatchUpsertOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut outcome = BatchUpsertOutcome::default();
        for m in ms {
            let result = save_message_tx(&tx, m)?;
            outcome.record(result);
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Up to `limit` rows for `conv_id` with `create_time < start_time`,
    /// newest first. `start_time == 0` or `== i64::MAX` both mean "the
    /// newest page".
    pub fn get_messages(
        &self,
        conv_id: &str,
        start_time: i64,
        limit: u32,
    ) -> StoreResult<Vec<Message>> {
        let conn = self.lock();
        let effective_start = if start_time == 0 { i64::MAX } else { start_time };
        let mut stmt = conn.prepare(
            "SELECT * FROM messages
             WHERE conversation_id = ?1 AND create_time < ?2
             ORDER BY create_time DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![conv_id, effective_start, limit], row_to_message)?;
        collect(rows)
    }

    /// Same as `get_messages` but paged on `seq` instead of `create_time`.
    pub fn get_messages_by_seq(
        &self,
        conv_id: &str,
        start_seq: i64,
        limit: u32,
    ) -> StoreResult<Vec<Message>> {
        let conn = self.lock();
        let effective_start = if start_seq == 0 { i64::MAX } else { start_seq };
        let mut stmt = conn.prepare(
            "SELECT * FROM messages
             WHERE conversation_id = ?1 AND seq < ?2
             ORDER BY seq DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![conv_id, effective_start, limit], row_to_message)?;
        collect(rows)
    }

    /// Messages in `[from_ms, to_ms]` inclusive, oldest first.
    pub fn get_messages_in_range(
        &self,
        conv_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> StoreResult<Vec<Message>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM messages
             WHERE conversation_id = ?1 AND create_time >= ?2 AND create_time <= ?3
             ORDER BY create_time ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![conv_id, from_ms, to_ms], row_to_message)?;
        collect(rows)
    }

    /// Case-insensitive substring search over `content` (treated as UTF-8
    /// text; callers passing binary `content` simply won't match).
    /// Special characters in `keyword` are matched literally. An empty or
    /// whitespace-only keyword returns no results.
    #[allow(clippy::too_many_arguments)]
    pub fn search_messages(
        &self,
        keyword: &str,
        conv_id: Option<&str>,
        types: Option<&[&str]>,
        from_ms: Option<i64>,
        to_ms: Option<i64>,
        limit: u32,
    ) -> StoreResult<Vec<Message>> {
        if keyword.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();

        let mut sql = String::from(
            "SELECT * FROM messages WHERE LOWER(CAST(content AS TEXT)) LIKE ?1 ESCAPE '\\'",
        );
        let escaped = escape_like(keyword);
        let like_pattern = format!("%{}%", escaped.to_lowercase());
        let mut bind_index = 2;
        let mut type_placeholders = String::new();

        if conv_id.is_some() {
            sql.push_str(&format!(" AND conversation_id = ?{bind_index}"));
            bind_index += 1;
        }
        if let Some(ts) = types {
            if !ts.is_empty() {
                let placeholders: Vec<String> = ts
                    .iter()
                    .map(|_| {
                        let p = format!("?{bind_index}");
                        bind_index += 1;
                        p
                    })
                    .collect();
                type_placeholders = placeholders.join(",");
                sql.push_str(&format!(" AND message_type IN ({type_placeholders})"));
            }
        }
        if from_ms.is_some() {
            sql.push_str(&format!(" AND create_time >= ?{bind_index}"));
            bind_index += 1;
        }
        if to_ms.is_some() {
            sql.push_str(&format!(" AND create_time <= ?{bind_index}"));
            bind_index += 1;
        }
        sql.push_str(" ORDER BY create_time DESC, id DESC LIMIT ?");
        sql.push_str(&bind_index.to_string());

        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        values.push(Box::new(like_pattern));
        if let Some(c) = conv_id {
            values.push(Box::new(c.to_string()));
        }
        if let Some(ts) = types {
            for t in ts {
                values.push(Box::new((*t).to_string()));
            }
        }
        if let Some(f) = from_ms {
            values.push(Box::new(f));
        }
        if let Some(t) = to_ms {
            values.push(Box::new(t));
        }
        values.push(Box::new(limit.min(MAX_SEARCH_LIMIT as u32) as i64));

        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), row_to_message)?;
        collect(rows)
    }

    /// The maximum `seq` across all stored messages (0 if none).
    pub fn get_max_seq(&self) -> StoreResult<i64> {
        let conn = self.lock();
        let max: Option<i64> = conn.query_row("SELECT MAX(seq) FROM messages", [], |r| r.get(0))?;
        Ok(max.unwrap_or(0))
    }

    pub fn get_oldest_time(&self, conv_id: &str) -> StoreResult<Option<i64>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT MIN(create_time) FROM messages WHERE conversation_id = ?1",
            params![conv_id],
            |r| r.get(0),
        )
        .optional_flatten()
    }

    pub fn get_latest_time(&self, conv_id: &str) -> StoreResult<Option<i64>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT MAX(create_time) FROM messages WHERE conversation_id = ?1",
            params![conv_id],
            |r| r.get(0),
        )
        .optional_flatten()
    }

    /// Apply a server-pushed revocation. Returns `false` if no row with
    /// `message_id` exists locally yet (e.g. the revoke push races ahead of
    /// the original message's own sync/push).
    pub fn mark_revoked(&self, message_id: &str, revoked_by: &str, revoked_time: i64) -> StoreResult<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE messages SET is_revoked = 1, revoked_by = ?1, revoked_time = ?2 WHERE message_id = ?3",
            params![revoked_by, revoked_time, message_id],
        )?;
        Ok(changed > 0)
    }

    /// Fold an incoming read receipt into the affected rows: add `reader_id`
    /// to `read_by` if absent, and advance `read_time` to the max seen.
    pub fn apply_read_receipt(
        &self,
        message_ids: &[String],
        reader_id: &str,
        read_time: i64,
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for message_id in message_ids {
            let row = {
                let mut stmt = tx.prepare("SELECT * FROM messages WHERE message_id = ?1")?;
                stmt.query_row(params![message_id], row_to_message).optional()?
            };
            let Some(mut message) = row else { continue };
            if !message.read_by.iter().any(|u| u == reader_id) {
                message.read_by.push(reader_id.to_string());
            }
            message.read_time = message.read_time.max(read_time);
            let read_by_json = serde_json::to_string(&message.read_by).unwrap_or_else(|_| "[]".to_string());
            tx.execute(
                "UPDATE messages SET read_by = ?1, read_time = ?2 WHERE message_id = ?3",
                params![read_by_json, message.read_time, message_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// `query_row` on an aggregate (`MIN`/`MAX`) returns a row with a NULL
/// value rather than no row, so we flatten `Option<Option<i64>>`.
trait OptionFlatten {
    fn optional_flatten(self) -> StoreResult<Option<i64>>;
}

impl OptionFlatten for Result<Option<i64>, rusqlite::Error> {
    fn optional_flatten(self) -> StoreResult<Option<i64>> {
        Ok(self?)
    }
}

fn save_message_tx(
    conn: &rusqlite::Connection,
    m: &Message,
) -> StoreResult<UpsertOutcome> {
    let (key, by_message_id) = m.primary_key();
    let existing = find_by_key(conn, key, by_message_id)?;

    match existing {
        None => {
            insert_message(conn, m)?;
            Ok(UpsertOutcome::Inserted)
        }
        Some(current) => {
            if rows_equal(&current, m) {
                Ok(UpsertOutcome::Skipped)
            } else {
                update_message(conn, key, by_message_id, m)?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }
}

fn find_by_key(
    conn: &rusqlite::Connection,
    key: &str,
    by_message_id: bool,
) -> StoreResult<Option<Message>> {
    let col = if by_message_id {
        "message_id"
    } else {
        "client_msg_id"
    };
    let sql = format!("SELECT * FROM messages WHERE {col} = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt
        .query_row(params![key], row_to_message)
        .optional()?;
    Ok(row)
}

fn insert_message(conn: &rusqlite::Connection, m: &Message) -> StoreResult<()> {
    let read_by = serde_json::to_string(&m.read_by).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT INTO messages
            (message_id, client_msg_id, conversation_id, conversation_type, sender_id,
             receiver_id, group_id, message_type, content, status, direction, seq,
             send_time, server_time, create_time, is_revoked, revoked_by, revoked_time,
             read_by, read_time)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
        params![
            m.message_id,
            m.client_msg_id,
            m.conversation_id,
            m.conversation_type.as_str(),
            m.sender_id,
            m.receiver_id,
            m.group_id,
            m.message_type,
            m.content,
            m.status.as_str(),
            m.direction.as_str(),
            m.seq,
            m.send_time,
            m.server_time,
            m.create_time,
            m.is_revoked as i64,
            m.revoked_by,
            m.revoked_time,
            read_by,
            m.read_time,
        ],
    )?;
    Ok(())
}

/// Update the row found by `(key, by_message_id)`. The key column itself
/// is also rewritten so a `client_msg_id`-keyed row can pick up the
/// `message_id` the server later assigns it, without creating a second row.
fn update_message(
    conn: &rusqlite::Connection,
    key: &str,
    by_message_id: bool,
    m: &Message,
) -> rusqlite::Result<()> {
    let read_by = serde_json::to_string(&m.read_by).unwrap_or_else(|_| "[]".to_string());
    let where_col = if by_message_id { "message_id" } else { "client_msg_id" };
    let sql = format!(
        "UPDATE messages SET
            message_id = ?1, client_msg_id = ?2, conversation_id = ?3, conversation_type = ?4,
            sender_id = ?5, receiver_id = ?6, group_id = ?7, message_type = ?8, content = ?9,
            status = ?10, direction = ?11, seq = ?12, send_time = ?13, server_time = ?14,
            create_time = ?15, is_revoked = ?16, revoked_by = ?17, revoked_time = ?18,
            read_by = ?19, read_time = ?20
         WHERE {where_col} = ?21"
    );
    conn.execute(
        &sql,
        params![
            m.message_id,
            m.client_msg_id,
            m.conversation_id,
            m.conversation_type.as_str(),
            m.sender_id,
            m.receiver_id,
            m.group_id,
            m.message_type,
            m.content,
            m.status.as_str(),
            m.direction.as_str(),
            m.seq,
            m.send_time,
            m.server_time,
            m.create_time,
            m.is_revoked as i64,
            m.revoked_by,
            m.revoked_time,
            read_by,
            m.read_time,
            key,
        ],
    )?;
    Ok(())
}

/// Fields considered for the `Updated` vs `Skipped` decision.
fn rows_equal(a: &Message, b: &Message) -> bool {
    a.content == b.content
        && a.status == b.status
        && a.seq == b.seq
        && a.server_time == b.server_time
        && a.message_id == b.message_id
        && a.is_revoked == b.is_revoked
        && a.revoked_by == b.revoked_by
        && a.revoked_time == b.revoked_time
        && a.read_by == b.read_by
        && a.read_time == b.read_time
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let read_by_json: String = row.get("read_by")?;
    let read_by: Vec<String> = serde_json::from_str(&read_by_json).unwrap_or_default();
    Ok(Message {
        message_id: row.get("message_id")?,
        client_msg_id: row.get("client_msg_id")?,
        conversation_id: row.get("conversation_id")?,
        conversation_type: crate::model::ConversationType::parse(&row.get::<_, String>("conversation_type")?),
        sender_id: row.get("sender_id")?,
        receiver_id: row.get("receiver_id")?,
        group_id: row.get("group_id")?,
        message_type: row.get("message_type")?,
        content: row.get("content")?,
        status: crate::model::MessageStatus::parse(&row.get::<_, String>("status")?),
        direction: crate::model::Direction::parse(&row.get::<_, String>("direction")?),
        seq: row.get("seq")?,
        send_time: row.get("send_time")?,
        server_time: row.get("server_time")?,
        create_time: row.get("create_time")?,
        is_revoked: row.get::<_, i64>("is_revoked")? != 0,
        revoked_by: row.get("revoked_by")?,
        revoked_time: row.get("revoked_time")?,
        read_by,
        read_time: row.get("read_time")?,
    })
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<Message>>,
) -> StoreResult<Vec<Message>> {
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Escape `%`, `_`, and `\` so `LIKE` treats the keyword literally.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
