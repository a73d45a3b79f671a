//! Fans decoded [`RouterEvent`]s out to the three places an inbound frame
//! can matter: the durable store, the outbound queue's ACK bookkeeping,
//! and the host application's observers.

use crate::error::SessionResult;
use crate::router::RouterEvent;
use imcore_store::{ConversationType, Direction, Message as StoreMessage, Store};
use std::collections::HashSet;
use std::sync::Arc;

/// Host-application callbacks. Default no-op bodies so an integrator only
/// overrides what they care about, matching the host-observer shape named
/// in the external interface.
pub trait SessionObserver: Send + Sync {
    fn on_message_received(&self, _message: &StoreMessage) {}
    fn on_message_revoked(&self, _message_id: &str, _revoked_by: &str) {}
    fn on_read_receipt(&self, _conversation_id: &str, _reader_id: &str, _message_ids: &[String]) {}
    fn on_typing_changed(&self, _conversation_id: &str, _user_id: &str, _is_typing: bool) {}
    fn on_kicked_out(&self, _reason: &str) {}
    fn on_message_failed(&self, _message: &StoreMessage) {}
}

pub struct NullSessionObserver;
impl SessionObserver for NullSessionObserver {}

/// What the dispatcher learned from one event, for `Session` to act on
/// beyond the store/observer side effects already applied.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Nothing further required.
    Handled,
    /// The server ended this session; `Session` must tear down the
    /// transport and stop auto-reconnect.
    KickedOut {
        reason: String,
    },
}

pub struct Dispatcher {
    store: Arc<Store>,
    observer: Arc<dyn SessionObserver>,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, observer: Arc<dyn SessionObserver>) -> Self {
        Self { store, observer }
    }

    pub fn dispatch(&self, event: RouterEvent) -> SessionResult<DispatchOutcome> {
        match event {
            RouterEvent::KickOut { reason } => {
                self.observer.on_kicked_out(&reason);
                Ok(DispatchOutcome::KickedOut { reason })
            }
            RouterEvent::Push { message } => {
                self.store.save_message(&message)?;
                self.touch_conversation(&message)?;
                self.observer.on_message_received(&message);
                Ok(DispatchOutcome::Handled)
            }
            RouterEvent::Batch { messages } => {
                self.store.save_messages(&messages)?;
                let mut touched = HashSet::new();
                for message in &messages {
                    self.touch_conversation(message)?;
                    touched.insert(message.conversation_id.clone());
                }
                // `touch_conversation` bumps unread_count per message, which
                // can overcount across a batch replayed after a failed sync
                // page; recompute once per touched conversation to settle it.
                for conversation_id in &touched {
                    self.store.calc_unread(conversation_id)?;
                }
                for message in &messages {
                    self.observer.on_message_received(message);
                }
                Ok(DispatchOutcome::Handled)
            }
            RouterEvent::RevokePush {
                message_id,
                revoked_by,
                revoked_time,
            } => {
                self.store.mark_revoked(&message_id, &revoked_by, revoked_time)?;
                self.observer.on_message_revoked(&message_id, &revoked_by);
                Ok(DispatchOutcome::Handled)
            }
            RouterEvent::ReadReceiptPush {
                conversation_id,
                reader_id,
                message_ids,
                read_time,
            } => {
                self.store.apply_read_receipt(&message_ids, &reader_id, read_time)?;
                self.observer.on_read_receipt(&conversation_id, &reader_id, &message_ids);
                Ok(DispatchOutcome::Handled)
            }
            RouterEvent::TypingPush {
                conversation_id,
                user_id,
                is_typing,
            } => {
                self.observer.on_typing_changed(&conversation_id, &user_id, is_typing);
                Ok(DispatchOutcome::Handled)
            }
            RouterEvent::Unrecognized { command } => {
                tracing::debug!(command, "dispatcher received unrecognized push, dropping");
                Ok(DispatchOutcome::Handled)
            }
        }
    }

    /// Ensure the conversation row exists and reflects this message as its
    /// most recent activity. Inbound messages bump `unread_count`; outbound
    /// ones never do.
    fn touch_conversation(&self, message: &StoreMessage) -> SessionResult<()> {
        self.store.ensure_conversation(
            &message.conversation_id,
            message.conversation_type,
            conversation_peer(message),
        )?;
        let from_self = matches!(message.direction, Direction::Send);
        self.store.update_last_message(
            &message.conversation_id,
            &message_summary(message),
            message.create_time,
            from_self,
        )?;
        Ok(())
    }

    /// Apply a `SendMsgRsp` ACK: update the queued row to its server-issued
    /// identity, so the store reflects `status=sent` under the
    /// server-assigned `message_id` going forward.
    pub fn apply_send_ack(&self, mut message: StoreMessage, server_message_id: String, server_time: i64, seq: i64) -> SessionResult<()> {
        message.message_id = server_message_id;
        message.server_time = server_time;
        message.seq = seq;
        message.status = imcore_store::MessageStatus::Sent;
        self.store.save_message(&message)?;
        Ok(())
    }
}

/// The conversation's counterparty: the other member for a single chat,
/// the group for a group/chatroom message.
fn conversation_peer(message: &StoreMessage) -> &str {
    match message.conversation_type {
        ConversationType::Group | ConversationType::Chatroom => &message.group_id,
        ConversationType::Single | ConversationType::System => match message.direction {
            Direction::Receive => &message.sender_id,
            Direction::Send => &message.receiver_id,
        },
    }
}

/// The conversation-list preview text for a message. Opaque binary content
/// (`message_type` other than text) still round-trips through `String`
/// lossily; conversation summaries are display text, not content storage.
fn message_summary(message: &StoreMessage) -> String {
    String::from_utf8_lossy(&message.content).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use imcore_store::{ConversationType, Direction, MessageStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn sample(message_id: &str) -> StoreMessage {
        StoreMessage {
            message_id: message_id.to_string(),
            client_msg_id: String::new(),
            conversation_id: "conv1".to_string(),
            conversation_type: ConversationType::Single,
            sender_id: "peer".to_string(),
            receiver_id: "u1".to_string(),
            group_id: String::new(),
            message_type: "text".to_string(),
            content: b"hi".to_vec(),
            status: MessageStatus::Delivered,
            direction: Direction::Receive,
            seq: 1,
            send_time: 1000,
            server_time: 1000,
            create_time: 1000,
            is_revoked: false,
            revoked_by: String::new(),
            revoked_time: 0,
            read_by: vec![],
            read_time: 0,
        }
    }

    struct RecordingObserver {
        received: AtomicUsize,
        revoked: Mutex<Vec<String>>,
        kicked: Mutex<Option<String>>,
    }

    impl SessionObserver for RecordingObserver {
        fn on_message_received(&self, _message: &StoreMessage) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
        fn on_message_revoked(&self, message_id: &str, _revoked_by: &str) {
            self.revoked.lock().unwrap().push(message_id.to_string());
        }
        fn on_kicked_out(&self, reason: &str) {
            *self.kicked.lock().unwrap() = Some(reason.to_string());
        }
    }

    fn observer() -> Arc<RecordingObserver> {
        Arc::new(RecordingObserver {
            received: AtomicUsize::new(0),
            revoked: Mutex::new(vec![]),
            kicked: Mutex::new(None),
        })
    }

    #[test]
    fn push_persists_and_notifies() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let obs = observer();
        let dispatcher = Dispatcher::new(store.clone(), obs.clone());

        let outcome = dispatcher
            .dispatch(RouterEvent::Push { message: sample("m1") })
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Handled));
        assert_eq!(obs.received.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_messages("conv1", 0, 10).unwrap().len(), 1);

        let conv = store.get_conversation("conv1").unwrap().unwrap();
        assert_eq!(conv.last_message, "hi");
        assert_eq!(conv.unread_count, 1, "inbound push must count as unread");
    }

    #[test]
    fn batch_push_settles_unread_count_once_per_conversation() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let obs = observer();
        let dispatcher = Dispatcher::new(store.clone(), obs.clone());

        let messages = vec![sample("m1"), sample("m2"), sample("m3")];
        dispatcher.dispatch(RouterEvent::Batch { messages }).unwrap();

        assert_eq!(obs.received.load(Ordering::SeqCst), 3);
        let conv = store.get_conversation("conv1").unwrap().unwrap();
        assert_eq!(conv.unread_count, 3);
    }

    #[test]
    fn revoke_push_marks_row_and_notifies() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.save_message(&sample("m1")).unwrap();
        let obs = observer();
        let dispatcher = Dispatcher::new(store.clone(), obs.clone());

        dispatcher
            .dispatch(RouterEvent::RevokePush {
                message_id: "m1".to_string(),
                revoked_by: "u2".to_string(),
                revoked_time: 9000,
            })
            .unwrap();

        assert_eq!(*obs.revoked.lock().unwrap(), vec!["m1".to_string()]);
        assert!(store.get_messages("conv1", 0, 10).unwrap()[0].is_revoked);
    }

    #[test]
    fn kick_out_reports_dispatch_outcome_and_observer() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let obs = observer();
        let dispatcher = Dispatcher::new(store, obs.clone());

        let outcome = dispatcher
            .dispatch(RouterEvent::KickOut { reason: "elsewhere".to_string() })
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::KickedOut { .. }));
        assert_eq!(obs.kicked.lock().unwrap().as_deref(), Some("elsewhere"));
    }
}
