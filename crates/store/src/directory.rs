//! Cached directory data: users, groups, group membership, and the
//! friend list. All upserts are idempotent so a full resync can simply
//! replay every record without special-casing "already known".

use crate::error::StoreResult;
use crate::model::{Friend, Group, User};
use crate::Store;
use rusqlite::{params, OptionalExtension, Row};

impl Store {
    pub fn upsert_user(&self, user: &User) -> StoreResult<()> {
        let conn = self.lock();
        let extra = serde_json::to_string(&user.extra).unwrap_or_else(|_| "{}".to_string());
        conn.execute(
            "INSERT INTO users (user_id, name, phone, avatar, extra)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                phone = excluded.phone,
                avatar = excluded.avatar,
                extra = excluded.extra",
            params![user.user_id, user.name, user.phone, user.avatar, extra],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM users WHERE user_id = ?1",
            params![user_id],
            row_to_user,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Users whose `name` or `phone` contains `keyword` (case-insensitive,
    /// literal).
    pub fn search_users(&self, keyword: &str, limit: u32) -> StoreResult<Vec<User>> {
        if keyword.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let pattern = format!("%{}%", keyword.to_lowercase());
        let mut stmt = conn.prepare(
            "SELECT * FROM users
             WHERE LOWER(name) LIKE ?1 OR LOWER(phone) LIKE ?1
             ORDER BY name ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, limit], row_to_user)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Groups whose `name` contains `keyword` (case-insensitive, literal).
    pub fn search_groups(&self, keyword: &str, limit: u32) -> StoreResult<Vec<Group>> {
        if keyword.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let pattern = format!("%{}%", keyword.to_lowercase());
        let mut stmt = conn.prepare(
            "SELECT * FROM groups WHERE LOWER(name) LIKE ?1 ORDER BY name ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, limit], row_to_group)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn upsert_group(&self, group: &Group) -> StoreResult<()> {
        let conn = self.lock();
        let extra = serde_json::to_string(&group.extra).unwrap_or_else(|_| "{}".to_string());
        conn.execute(
            "INSERT INTO groups (group_id, name, avatar, member_count, extra)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(group_id) DO UPDATE SET
                name = excluded.name,
                avatar = excluded.avatar,
                extra = excluded.extra",
            params![group.group_id, group.name, group.avatar, group.member_count, extra],
        )?;
        Ok(())
    }

    pub fn get_group(&self, group_id: &str) -> StoreResult<Option<Group>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM groups WHERE group_id = ?1",
            params![group_id],
            row_to_group,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Delete a group and its membership rows in one transaction.
    pub fn delete_group(&self, group_id: &str) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM group_members WHERE group_id = ?1", params![group_id])?;
        tx.execute("DELETE FROM groups WHERE group_id = ?1", params![group_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Add a member and refresh `groups.member_count` to match reality.
    pub fn add_group_member(&self, group_id: &str, user_id: &str) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
            params![group_id, user_id],
        )?;
        refresh_member_count(&tx, group_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_group_member(&self, group_id: &str, user_id: &str) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
        )?;
        refresh_member_count(&tx, group_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_group_members(&self, group_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id")?;
        let rows = stmt.query_map(params![group_id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn upsert_friend(&self, friend: &Friend) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO friends (owner_user_id, friend_user_id, remark)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(owner_user_id, friend_user_id) DO UPDATE SET remark = excluded.remark",
            params![friend.owner_user_id, friend.friend_user_id, friend.remark],
        )?;
        Ok(())
    }

    pub fn remove_friend(&self, owner_user_id: &str, friend_user_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM friends WHERE owner_user_id = ?1 AND friend_user_id = ?2",
            params![owner_user_id, friend_user_id],
        )?;
        Ok(())
    }

    pub fn list_friends(&self, owner_user_id: &str) -> StoreResult<Vec<Friend>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT owner_user_id, friend_user_id, remark FROM friends
             WHERE owner_user_id = ?1 ORDER BY friend_user_id",
        )?;
        let rows = stmt.query_map(params![owner_user_id], |r| {
            Ok(Friend {
                owner_user_id: r.get(0)?,
                friend_user_id: r.get(1)?,
                remark: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Friends of `owner_user_id` whose `remark` contains `keyword`
    /// (case-insensitive, literal).
    pub fn search_friends(&self, owner_user_id: &str, keyword: &str, limit: u32) -> StoreResult<Vec<Friend>> {
        if keyword.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let pattern = format!("%{}%", keyword.to_lowercase());
        let mut stmt = conn.prepare(
            "SELECT owner_user_id, friend_user_id, remark FROM friends
             WHERE owner_user_id = ?1 AND LOWER(remark) LIKE ?2
             ORDER BY friend_user_id LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![owner_user_id, pattern, limit], |r| {
            Ok(Friend {
                owner_user_id: r.get(0)?,
                friend_user_id: r.get(1)?,
                remark: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn refresh_member_count(conn: &rusqlite::Connection, group_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE groups SET member_count = (
            SELECT COUNT(*) FROM group_members WHERE group_members.group_id = ?1
         ) WHERE group_id = ?1",
        params![group_id],
    )?;
    Ok(())
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let extra_json: String = row.get("extra")?;
    Ok(User {
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        phone: row.get("phone")?,
        avatar: row.get("avatar")?,
        extra: serde_json::from_str(&extra_json).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_group(row: &Row<'_>) -> rusqlite::Result<Group> {
    let extra_json: String = row.get("extra")?;
    Ok(Group {
        group_id: row.get("group_id")?,
        name: row.get("name")?,
        avatar: row.get("avatar")?,
        member_count: row.get("member_count")?,
        extra: serde_json::from_str(&extra_json).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn user(id: &str, name: &str) -> User {
        User {
            user_id: id.to_string(),
            name: name.to_string(),
            phone: String::new(),
            avatar: String::new(),
            extra: serde_json::Value::Null,
        }
    }

    #[test]
    fn user_upsert_is_idempotent_and_updates_fields() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(&user("u1", "Alice")).unwrap();
        store.upsert_user(&user("u1", "Alice Updated")).unwrap();

        let got = store.get_user("u1").unwrap().unwrap();
        assert_eq!(got.name, "Alice Updated");
    }

    #[test]
    fn search_users_matches_case_insensitively() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(&user("u1", "Alice")).unwrap();
        store.upsert_user(&user("u2", "Bob")).unwrap();

        let found = store.search_users("ali", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_id, "u1");
    }

    #[test]
    fn search_users_matches_phone_substring() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_user(&User {
                user_id: "u1".to_string(),
                name: "Alice".to_string(),
                phone: "+1-555-0142".to_string(),
                avatar: String::new(),
                extra: serde_json::Value::Null,
            })
            .unwrap();
        store.upsert_user(&user("u2", "Bob")).unwrap();

        let found = store.search_users("5550142", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_id, "u1");
    }

    #[test]
    fn search_groups_matches_name_case_insensitively() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_group(&Group {
                group_id: "g1".to_string(),
                name: "Engineering Team".to_string(),
                avatar: String::new(),
                member_count: 0,
                extra: serde_json::Value::Null,
            })
            .unwrap();

        let found = store.search_groups("engineering", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].group_id, "g1");
        assert!(store.search_groups("marketing", 10).unwrap().is_empty());
    }

    #[test]
    fn search_friends_matches_remark() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_friend(&Friend {
                owner_user_id: "u1".to_string(),
                friend_user_id: "u2".to_string(),
                remark: "college buddy".to_string(),
            })
            .unwrap();
        store
            .upsert_friend(&Friend {
                owner_user_id: "u1".to_string(),
                friend_user_id: "u3".to_string(),
                remark: "coworker".to_string(),
            })
            .unwrap();

        let found = store.search_friends("u1", "buddy", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].friend_user_id, "u2");
        assert!(store.search_friends("u1", "", 10).unwrap().is_empty());
    }

    #[test]
    fn member_count_tracks_add_and_remove() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_group(&Group {
                group_id: "g1".to_string(),
                name: "Team".to_string(),
                avatar: String::new(),
                member_count: 0,
                extra: serde_json::Value::Null,
            })
            .unwrap();

        store.add_group_member("g1", "u1").unwrap();
        store.add_group_member("g1", "u2").unwrap();
        assert_eq!(store.get_group("g1").unwrap().unwrap().member_count, 2);

        store.remove_group_member("g1", "u1").unwrap();
        assert_eq!(store.get_group("g1").unwrap().unwrap().member_count, 1);
        assert_eq!(store.list_group_members("g1").unwrap(), vec!["u2".to_string()]);
    }

    #[test]
    fn delete_group_cascades_membership() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_group(&Group {
                group_id: "g1".to_string(),
                name: "Team".to_string(),
                avatar: String::new(),
                member_count: 0,
                extra: serde_json::Value::Null,
            })
            .unwrap();
        store.add_group_member("g1", "u1").unwrap();

        store.delete_group("g1").unwrap();
        assert!(store.get_group("g1").unwrap().is_none());
        assert!(store.list_group_members("g1").unwrap().is_empty());
    }

    #[test]
    fn friend_upsert_and_remove() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_friend(&Friend {
                owner_user_id: "u1".to_string(),
                friend_user_id: "u2".to_string(),
                remark: "college buddy".to_string(),
            })
            .unwrap();

        let friends = store.list_friends("u1").unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].remark, "college buddy");

        store.remove_friend("u1", "u2").unwrap();
        assert!(store.list_friends("u1").unwrap().is_empty());
    }
}
