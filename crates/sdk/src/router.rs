//! Command-tag dispatch: decodes a pushed frame's `command` + `body` into
//! a typed [`RouterEvent`], the single point translating wire bytes into
//! the domain shapes `Dispatcher`, `SyncEngine`, and `TypingTracker`
//! consume. Frames already claimed by a pending `request()` never reach
//! here — this only sees unsolicited server-initiated frames.

use imcore_store::{ConversationType, Direction, Message as StoreMessage, MessageStatus};
use imcore_wire::command::Tag;
use imcore_wire::pb;
use prost::Message as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("failed to decode {tag:?} body: {source}")]
    Decode {
        tag: Tag,
        #[source]
        source: prost::DecodeError,
    },
    #[error("{tag:?} body is missing its required `message` field")]
    MissingMessage { tag: Tag },
}

#[derive(Debug, Clone)]
pub enum RouterEvent {
    KickOut {
        reason: String,
    },
    Push {
        message: StoreMessage,
    },
    Batch {
        messages: Vec<StoreMessage>,
    },
    RevokePush {
        message_id: String,
        revoked_by: String,
        revoked_time: i64,
    },
    ReadReceiptPush {
        conversation_id: String,
        reader_id: String,
        message_ids: Vec<String>,
        read_time: i64,
    },
    TypingPush {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
    /// A command this build doesn't recognize. Logged and dropped rather
    /// than treated as an error, so a server on a newer protocol revision
    /// doesn't take the connection down.
    Unrecognized {
        command: u16,
    },
}

/// Decode one unsolicited frame into a [`RouterEvent`].
pub fn route(command: u16, body: &[u8]) -> Result<RouterEvent, RouterError> {
    let tag = Tag::from_u16(command);
    match tag {
        Tag::KickOut => {
            let msg = pb::KickOut::decode(body).map_err(|source| RouterError::Decode { tag, source })?;
            Ok(RouterEvent::KickOut { reason: msg.reason })
        }
        Tag::PushMsg => {
            let msg = pb::PushMsg::decode(body).map_err(|source| RouterError::Decode { tag, source })?;
            let message = msg.message.ok_or(RouterError::MissingMessage { tag })?;
            Ok(RouterEvent::Push {
                message: from_pb_message(message),
            })
        }
        Tag::BatchMsg => {
            let msg = pb::BatchMsg::decode(body).map_err(|source| RouterError::Decode { tag, source })?;
            Ok(RouterEvent::Batch {
                messages: msg.messages.into_iter().map(from_pb_message).collect(),
            })
        }
        Tag::RevokePush => {
            let msg = pb::RevokePush::decode(body).map_err(|source| RouterError::Decode { tag, source })?;
            Ok(RouterEvent::RevokePush {
                message_id: msg.message_id,
                revoked_by: msg.revoked_by,
                revoked_time: msg.revoked_time,
            })
        }
        Tag::ReadReceiptPush => {
            let msg = pb::ReadReceiptPush::decode(body).map_err(|source| RouterError::Decode { tag, source })?;
            Ok(RouterEvent::ReadReceiptPush {
                conversation_id: msg.conversation_id,
                reader_id: msg.reader_id,
                message_ids: msg.message_ids,
                read_time: msg.read_time,
            })
        }
        Tag::TypingPush => {
            let msg = pb::TypingPush::decode(body).map_err(|source| RouterError::Decode { tag, source })?;
            Ok(RouterEvent::TypingPush {
                conversation_id: msg.conversation_id,
                user_id: msg.user_id,
                is_typing: msg.is_typing,
            })
        }
        Tag::Unknown(v) => {
            tracing::debug!(command = v, "dropping unrecognized push command");
            Ok(RouterEvent::Unrecognized { command: v })
        }
        recognized_but_not_a_push => {
            tracing::debug!(?recognized_but_not_a_push, "dropping request/response command received as a push");
            Ok(RouterEvent::Unrecognized { command })
        }
    }
}

pub(crate) fn from_pb_message(m: pb::Message) -> StoreMessage {
    StoreMessage {
        message_id: m.message_id,
        client_msg_id: m.client_msg_id,
        conversation_id: m.conversation_id,
        conversation_type: from_pb_conversation_type(m.conversation_type),
        sender_id: m.sender_id,
        receiver_id: m.receiver_id,
        group_id: m.group_id,
        message_type: m.message_type,
        content: m.content,
        status: MessageStatus::Delivered,
        direction: Direction::Receive,
        seq: m.seq,
        send_time: m.send_time,
        server_time: m.server_time,
        create_time: m.server_time,
        is_revoked: m.is_revoked,
        revoked_by: m.revoked_by,
        revoked_time: m.revoked_time,
        read_by: m.read_by,
        read_time: m.read_time,
    }
}

/// The inverse of [`from_pb_message`], used when encoding an outbound
/// message for the wire.
pub(crate) fn to_pb_message(m: &StoreMessage) -> pb::Message {
    pb::Message {
        message_id: m.message_id.clone(),
        client_msg_id: m.client_msg_id.clone(),
        conversation_id: m.conversation_id.clone(),
        conversation_type: to_pb_conversation_type(m.conversation_type) as i32,
        sender_id: m.sender_id.clone(),
        receiver_id: m.receiver_id.clone(),
        group_id: m.group_id.clone(),
        message_type: m.message_type.clone(),
        content: m.content.clone(),
        seq: m.seq,
        send_time: m.send_time,
        server_time: m.server_time,
        is_revoked: m.is_revoked,
        revoked_by: m.revoked_by.clone(),
        revoked_time: m.revoked_time,
        read_by: m.read_by.clone(),
        read_time: m.read_time,
    }
}

fn to_pb_conversation_type(t: ConversationType) -> pb::ConversationType {
    match t {
        ConversationType::Single => pb::ConversationType::Single,
        ConversationType::Group => pb::ConversationType::Group,
        ConversationType::Chatroom => pb::ConversationType::Chatroom,
        ConversationType::System => pb::ConversationType::System,
    }
}

fn from_pb_conversation_type(v: i32) -> ConversationType {
    match pb::ConversationType::try_from(v).unwrap_or(pb::ConversationType::Single) {
        pb::ConversationType::Single => ConversationType::Single,
        pb::ConversationType::Group => ConversationType::Group,
        pb::ConversationType::Chatroom => ConversationType::Chatroom,
        pb::ConversationType::System => ConversationType::System,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn routes_kick_out() {
        let body = pb::KickOut {
            reason: "logged in elsewhere".to_string(),
        }
        .encode_to_vec();
        let event = route(Tag::KickOut.to_u16(), &body).unwrap();
        match event {
            RouterEvent::KickOut { reason } => assert_eq!(reason, "logged in elsewhere"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn routes_push_message() {
        let body = pb::PushMsg {
            message: Some(pb::Message {
                message_id: "m1".to_string(),
                client_msg_id: "c1".to_string(),
                conversation_id: "conv1".to_string(),
                conversation_type: pb::ConversationType::Single as i32,
                sender_id: "u2".to_string(),
                receiver_id: "u1".to_string(),
                seq: 42,
                ..Default::default()
            }),
        }
        .encode_to_vec();

        let event = route(Tag::PushMsg.to_u16(), &body).unwrap();
        match event {
            RouterEvent::Push { message } => {
                assert_eq!(message.message_id, "m1");
                assert_eq!(message.seq, 42);
                assert_eq!(message.direction, Direction::Receive);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn push_message_missing_payload_is_an_error() {
        let body = pb::PushMsg { message: None }.encode_to_vec();
        let err = route(Tag::PushMsg.to_u16(), &body).unwrap_err();
        assert!(matches!(err, RouterError::MissingMessage { .. }));
    }

    #[test]
    fn unknown_command_is_dropped_not_errored() {
        let event = route(9999, &[]).unwrap();
        assert!(matches!(event, RouterEvent::Unrecognized { command: 9999 }));
    }

    #[test]
    fn routes_batch_message() {
        let body = pb::BatchMsg {
            messages: vec![
                pb::Message {
                    message_id: "m1".to_string(),
                    ..Default::default()
                },
                pb::Message {
                    message_id: "m2".to_string(),
                    ..Default::default()
                },
            ],
        }
        .encode_to_vec();
        let event = route(Tag::BatchMsg.to_u16(), &body).unwrap();
        match event {
            RouterEvent::Batch { messages } => assert_eq!(messages.len(), 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn routes_typing_push() {
        let body = pb::TypingPush {
            conversation_id: "conv1".to_string(),
            user_id: "u2".to_string(),
            is_typing: true,
        }
        .encode_to_vec();
        let event = route(Tag::TypingPush.to_u16(), &body).unwrap();
        match event {
            RouterEvent::TypingPush { is_typing, .. } => assert!(is_typing),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
