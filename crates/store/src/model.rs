//! Domain row types persisted by the `Store`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationType {
    Single,
    Group,
    Chatroom,
    System,
}

impl Default for ConversationType {
    fn default() -> Self {
        ConversationType::Single
    }
}

impl ConversationType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationType::Single => "single",
            ConversationType::Group => "group",
            ConversationType::Chatroom => "chatroom",
            ConversationType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "group" => ConversationType::Group,
            "chatroom" => ConversationType::Chatroom,
            "system" => ConversationType::System,
            _ => ConversationType::Single,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => MessageStatus::Sent,
            "delivered" => MessageStatus::Delivered,
            "read" => MessageStatus::Read,
            "failed" => MessageStatus::Failed,
            _ => MessageStatus::Sending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "receive" => Direction::Receive,
            _ => Direction::Send,
        }
    }
}

/// A single chat message, keyed by `message_id` when the server has
/// assigned one, else by `client_msg_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub client_msg_id: String,
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub sender_id: String,
    pub receiver_id: String,
    pub group_id: String,
    pub message_type: String,
    pub content: Vec<u8>,
    pub status: MessageStatus,
    pub direction: Direction,
    pub seq: i64,
    pub send_time: i64,
    pub server_time: i64,
    pub create_time: i64,
    pub is_revoked: bool,
    pub revoked_by: String,
    pub revoked_time: i64,
    pub read_by: Vec<String>,
    pub read_time: i64,
}

impl Message {
    /// The key used to find an existing row: `message_id` when set, else
    /// `client_msg_id`.
    pub fn primary_key(&self) -> (&str, bool) {
        if !self.message_id.is_empty() {
            (&self.message_id, true)
        } else {
            (&self.client_msg_id, false)
        }
    }
}

/// Outcome of `Store::save_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Skipped,
}

/// Outcome of `Store::save_messages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchUpsertOutcome {
    pub inserted_count: u64,
    pub updated_count: u64,
    pub skipped_count: u64,
}

impl BatchUpsertOutcome {
    pub fn total(&self) -> u64 {
        self.inserted_count + self.updated_count + self.skipped_count
    }

    pub fn dedup_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.skipped_count as f64 / total as f64
        }
    }

    pub(crate) fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted_count += 1,
            UpsertOutcome::Updated => self.updated_count += 1,
            UpsertOutcome::Skipped => self.skipped_count += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub peer_id_or_group_id: String,
    pub last_message: String,
    pub last_message_time: i64,
    pub unread_count: i64,
    pub last_read_time: i64,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub draft: String,
    pub update_time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub phone: String,
    pub avatar: String,
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub name: String,
    pub avatar: String,
    pub member_count: i64,
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Friend {
    pub owner_user_id: String,
    pub friend_user_id: String,
    pub remark: String,
}

/// Per-user sync watermark, persisted across process restarts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub last_sync_seq: i64,
    pub last_sync_time: i64,
    pub is_syncing: bool,
}
