//! Conversation list maintenance: last-message summary, unread counters,
//! pin/mute flags, and drafts.

use crate::error::StoreResult;
use crate::model::{Conversation, ConversationType};
use crate::Store;
use rusqlite::{params, OptionalExtension, Row};

impl Store {
    /// Create the conversation row if absent, leaving existing fields alone.
    pub fn ensure_conversation(
        &self,
        conversation_id: &str,
        conversation_type: ConversationType,
        peer_id_or_group_id: &str,
    ) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO conversations
                (conversation_id, conversation_type, peer_id_or_group_id, update_time)
             VALUES (?1, ?2, ?3, 0)",
            params![conversation_id, conversation_type.as_str(), peer_id_or_group_id],
        )?;
        Ok(())
    }

    /// Update the last-message summary shown in a conversation list, and
    /// bump `unread_count` unless `from_self` (own outgoing messages never
    /// count as unread).
    pub fn update_last_message(
        &self,
        conversation_id: &str,
        summary: &str,
        message_time: i64,
        from_self: bool,
    ) -> StoreResult<()> {
        let conn = self.lock();
        if from_self {
            conn.execute(
                "UPDATE conversations
                 SET last_message = ?2, last_message_time = ?3, update_time = ?3
                 WHERE conversation_id = ?1",
                params![conversation_id, summary, message_time],
            )?;
        } else {
            conn.execute(
                "UPDATE conversations
                 SET last_message = ?2, last_message_time = ?3, update_time = ?3,
                     unread_count = unread_count + 1
                 WHERE conversation_id = ?1",
                params![conversation_id, summary, message_time],
            )?;
        }
        Ok(())
    }

    /// Mark everything up to `read_time` as read: `unread_count` reset to
    /// zero, `last_read_time` advanced (never rewound by a stale call).
    pub fn mark_read(&self, conversation_id: &str, read_time: i64) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE conversations
             SET unread_count = 0,
                 last_read_time = MAX(last_read_time, ?2)
             WHERE conversation_id = ?1",
            params![conversation_id, read_time],
        )?;
        Ok(())
    }

    /// Recompute `unread_count` from `messages` rather than trusting the
    /// incremental counter in `update_last_message` — repairs drift from a
    /// dispatch replay or a host app writing to the store directly.
    pub fn calc_unread(&self, conversation_id: &str) -> StoreResult<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND direction = 'receive'
               AND create_time > (SELECT last_read_time FROM conversations WHERE conversation_id = ?1)",
            params![conversation_id],
            |r| r.get(0),
        )?;
        conn.execute(
            "UPDATE conversations SET unread_count = ?2 WHERE conversation_id = ?1",
            params![conversation_id, count],
        )?;
        Ok(count)
    }

    pub fn set_pinned(&self, conversation_id: &str, pinned: bool) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE conversations SET is_pinned = ?2 WHERE conversation_id = ?1",
            params![conversation_id, pinned as i64],
        )?;
        Ok(())
    }

    pub fn set_muted(&self, conversation_id: &str, muted: bool) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE conversations SET is_muted = ?2 WHERE conversation_id = ?1",
            params![conversation_id, muted as i64],
        )?;
        Ok(())
    }

    pub fn update_draft(&self, conversation_id: &str, draft: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE conversations SET draft = ?2 WHERE conversation_id = ?1",
            params![conversation_id, draft],
        )?;
        Ok(())
    }

    /// All conversations, pinned first, each group ordered by most recent
    /// activity.
    pub fn list_conversations(&self) -> StoreResult<Vec<Conversation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM conversations
             ORDER BY is_pinned DESC, last_message_time DESC",
        )?;
        let rows = stmt.query_map([], row_to_conversation)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
            row_to_conversation,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Sum of `unread_count` across all conversations that are not muted.
    pub fn total_unread(&self) -> StoreResult<i64> {
        let conn = self.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(unread_count), 0) FROM conversations WHERE is_muted = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(total)
    }
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        conversation_id: row.get("conversation_id")?,
        conversation_type: ConversationType::parse(&row.get::<_, String>("conversation_type")?),
        peer_id_or_group_id: row.get("peer_id_or_group_id")?,
        last_message: row.get("last_message")?,
        last_message_time: row.get("last_message_time")?,
        unread_count: row.get("unread_count")?,
        last_read_time: row.get("last_read_time")?,
        is_pinned: row.get::<_, i64>("is_pinned")? != 0,
        is_muted: row.get::<_, i64>("is_muted")? != 0,
        draft: row.get("draft")?,
        update_time: row.get("update_time")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn seeded(store: &Store) {
        store
            .ensure_conversation("c1", ConversationType::Single, "u2")
            .unwrap();
        store
            .ensure_conversation("c2", ConversationType::Group, "g1")
            .unwrap();
    }

    #[test]
    fn unread_count_increments_on_incoming_but_not_outgoing() {
        let store = Store::open_in_memory().unwrap();
        seeded(&store);

        store.update_last_message("c1", "hi", 100, false).unwrap();
        store.update_last_message("c1", "hi again", 200, false).unwrap();
        store.update_last_message("c1", "my reply", 300, true).unwrap();

        let conv = store.get_conversation("c1").unwrap().unwrap();
        assert_eq!(conv.unread_count, 2);
        assert_eq!(conv.last_message, "my reply");
        assert_eq!(conv.last_message_time, 300);
    }

    #[test]
    fn mark_read_resets_unread_and_does_not_rewind() {
        let store = Store::open_in_memory().unwrap();
        seeded(&store);
        store.update_last_message("c1", "hi", 100, false).unwrap();
        store.mark_read("c1", 500).unwrap();

        let conv = store.get_conversation("c1").unwrap().unwrap();
        assert_eq!(conv.unread_count, 0);
        assert_eq!(conv.last_read_time, 500);

        store.mark_read("c1", 10).unwrap();
        let conv = store.get_conversation("c1").unwrap().unwrap();
        assert_eq!(conv.last_read_time, 500, "read time must never rewind");
    }

    #[test]
    fn pinned_conversations_sort_first() {
        let store = Store::open_in_memory().unwrap();
        seeded(&store);
        store.update_last_message("c1", "a", 100, false).unwrap();
        store.update_last_message("c2", "b", 200, false).unwrap();
        store.set_pinned("c1", true).unwrap();

        let list = store.list_conversations().unwrap();
        assert_eq!(list[0].conversation_id, "c1");
        assert_eq!(list[1].conversation_id, "c2");
    }

    #[test]
    fn muted_conversations_excluded_from_total_unread() {
        let store = Store::open_in_memory().unwrap();
        seeded(&store);
        store.update_last_message("c1", "a", 100, false).unwrap();
        store.update_last_message("c2", "b", 200, false).unwrap();
        store.set_muted("c2", true).unwrap();

        assert_eq!(store.total_unread().unwrap(), 1);
    }

    #[test]
    fn calc_unread_recomputes_from_messages() {
        use crate::model::{ConversationType as CT, Direction, Message, MessageStatus};

        let store = Store::open_in_memory().unwrap();
        seeded(&store);

        let mut m = Message {
            message_id: "m1".to_string(),
            client_msg_id: String::new(),
            conversation_id: "c1".to_string(),
            conversation_type: CT::Single,
            sender_id: "u2".to_string(),
            receiver_id: "u1".to_string(),
            group_id: String::new(),
            message_type: "text".to_string(),
            content: b"hi".to_vec(),
            status: MessageStatus::Delivered,
            direction: Direction::Receive,
            seq: 1,
            send_time: 100,
            server_time: 100,
            create_time: 100,
            is_revoked: false,
            revoked_by: String::new(),
            revoked_time: 0,
            read_by: vec![],
            read_time: 0,
        };
        store.save_message(&m).unwrap();
        m.message_id = "m2".to_string();
        m.create_time = 200;
        m.send_time = 200;
        m.server_time = 200;
        store.save_message(&m).unwrap();

        // Drift: counter manually desynced from reality.
        store.mark_read("c1", 0).unwrap();
        assert_eq!(store.calc_unread("c1").unwrap(), 2);
        assert_eq!(store.get_conversation("c1").unwrap().unwrap().unread_count, 2);

        store.mark_read("c1", 150).unwrap();
        assert_eq!(store.calc_unread("c1").unwrap(), 1);
    }

    #[test]
    fn draft_round_trips() {
        let store = Store::open_in_memory().unwrap();
        seeded(&store);
        store.update_draft("c1", "unsent thought").unwrap();
        let conv = store.get_conversation("c1").unwrap().unwrap();
        assert_eq!(conv.draft, "unsent thought");
    }
}
