//! Per-conversation ephemeral "is typing" state: send-side debounce plus
//! auto-stop, receive-side per-`(conversation, user)` expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Notified on both the send side (a "stop" frame should go out) and the
/// receive side (a peer's typing state changed). Held weakly so a
/// listener's owner can drop it without unregistering first.
pub trait TypingListener: Send + Sync {
    fn on_send_stop(&self, conversation_id: &str) {
        let _ = conversation_id;
    }
    fn on_typing_changed(&self, conversation_id: &str, user_id: &str, is_typing: bool) {
        let _ = (conversation_id, user_id, is_typing);
    }
}

/// The capability needed to actually put a typing frame on the wire;
/// narrowed so tests can assert on what was sent without a real transport.
#[async_trait::async_trait]
pub trait TypingSender: Send + Sync {
    async fn send_typing_frame(&self, conversation_id: &str, is_typing: bool);
}

struct SendState {
    last_sent: Option<Instant>,
    stop_timer: Option<JoinHandle<()>>,
}

struct RecvState {
    is_typing: bool,
    expiry_timer: Option<JoinHandle<()>>,
}

pub struct TypingTracker<S: TypingSender + 'static> {
    current_user_id: String,
    send_interval: Duration,
    stop_delay: Duration,
    recv_timeout: Duration,
    sender: Arc<S>,
    listeners: Mutex<Vec<Weak<dyn TypingListener>>>,
    send_state: Mutex<HashMap<String, SendState>>,
    recv_state: Mutex<HashMap<(String, String), RecvState>>,
}

impl<S: TypingSender + 'static> TypingTracker<S> {
    pub fn new(
        current_user_id: impl Into<String>,
        sender: Arc<S>,
        send_interval: Duration,
        stop_delay: Duration,
        recv_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            current_user_id: current_user_id.into(),
            send_interval,
            stop_delay,
            recv_timeout,
            sender,
            listeners: Mutex::new(Vec::new()),
            send_state: Mutex::new(HashMap::new()),
            recv_state: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_listener(&self, listener: &Arc<dyn TypingListener>) {
        self.listeners.lock().expect("listeners poisoned").push(Arc::downgrade(listener));
    }

    fn notify<F: Fn(&dyn TypingListener)>(&self, f: F) {
        let mut listeners = self.listeners.lock().expect("listeners poisoned");
        listeners.retain(|weak| {
            if let Some(listener) = weak.upgrade() {
                f(listener.as_ref());
                true
            } else {
                false
            }
        });
    }

    /// Debounced send: at most one "typing" frame per `send_interval` per
    /// conversation. Each call (re)arms an auto-stop timer that fires a
    /// "stop" frame after `stop_delay` of silence.
    pub async fn send_typing(self: &Arc<Self>, conversation_id: &str) {
        let should_send = {
            let mut state = self.send_state.lock().expect("send_state poisoned");
            let entry = state.entry(conversation_id.to_string()).or_insert(SendState {
                last_sent: None,
                stop_timer: None,
            });
            if let Some(handle) = entry.stop_timer.take() {
                handle.abort();
            }
            let due = entry.last_sent.map(|t| t.elapsed() >= self.send_interval).unwrap_or(true);
            if due {
                entry.last_sent = Some(Instant::now());
            }
            due
        };

        if should_send {
            self.sender.send_typing_frame(conversation_id, true).await;
        }

        let this = Arc::clone(self);
        let conv_id = conversation_id.to_string();
        let stop_delay = self.stop_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(stop_delay).await;
            this.sender.send_typing_frame(&conv_id, false).await;
            this.notify(|l| l.on_send_stop(&conv_id));
            let mut state = this.send_state.lock().expect("send_state poisoned");
            if let Some(entry) = state.get_mut(&conv_id) {
                entry.last_sent = None;
            }
        });

        let mut state = self.send_state.lock().expect("send_state poisoned");
        if let Some(entry) = state.get_mut(conversation_id) {
            entry.stop_timer = Some(handle);
        }
    }

    /// Receive side: ignores frames from `current_user_id` (a device's own
    /// echo). Arms a per-`(conversation, user)` timer that auto-expires the
    /// state as if a "stop" had arrived, since the wire doesn't guarantee
    /// one.
    pub fn handle_typing(self: &Arc<Self>, conversation_id: &str, user_id: &str, is_typing: bool) {
        if user_id == self.current_user_id {
            return;
        }
        let key = (conversation_id.to_string(), user_id.to_string());

        {
            let mut state = self.recv_state.lock().expect("recv_state poisoned");
            let entry = state.entry(key.clone()).or_insert(RecvState {
                is_typing: false,
                expiry_timer: None,
            });
            if let Some(handle) = entry.expiry_timer.take() {
                handle.abort();
            }
            entry.is_typing = is_typing;
        }

        self.notify(|l| l.on_typing_changed(conversation_id, user_id, is_typing));

        if !is_typing {
            return;
        }

        let this = Arc::clone(self);
        let key_for_timer = key.clone();
        let recv_timeout = self.recv_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(recv_timeout).await;
            let mut state = this.recv_state.lock().expect("recv_state poisoned");
            if let Some(entry) = state.get_mut(&key_for_timer) {
                entry.is_typing = false;
                entry.expiry_timer = None;
            }
            drop(state);
            this.notify(|l| l.on_typing_changed(&key_for_timer.0, &key_for_timer.1, false));
        });

        let mut state = self.recv_state.lock().expect("recv_state poisoned");
        if let Some(entry) = state.get_mut(&key) {
            entry.expiry_timer = Some(handle);
        }
    }

    pub fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        self.recv_state
            .lock()
            .expect("recv_state poisoned")
            .iter()
            .filter(|((conv, _), state)| conv == conversation_id && state.is_typing)
            .map(|((_, user), _)| user.clone())
            .collect()
    }

    pub fn is_typing(&self, user_id: &str, conversation_id: &str) -> bool {
        self.recv_state
            .lock()
            .expect("recv_state poisoned")
            .get(&(conversation_id.to_string(), user_id.to_string()))
            .map(|s| s.is_typing)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingSender {
        sent: StdMutex<Vec<(String, bool)>>,
    }

    #[async_trait::async_trait]
    impl TypingSender for RecordingSender {
        async fn send_typing_frame(&self, conversation_id: &str, is_typing: bool) {
            self.sent.lock().unwrap().push((conversation_id.to_string(), is_typing));
        }
    }

    struct CountingListener {
        changes: AtomicUsize,
    }
    impl TypingListener for CountingListener {
        fn on_typing_changed(&self, _conversation_id: &str, _user_id: &str, _is_typing: bool) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn send_typing_debounces_within_interval() {
        let sender = Arc::new(RecordingSender { sent: StdMutex::new(vec![]) });
        let tracker = TypingTracker::new("u1", sender.clone(), Duration::from_secs(5), Duration::from_secs(5), Duration::from_secs(8));

        tracker.send_typing("conv1").await;
        tracker.send_typing("conv1").await;

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.iter().filter(|(_, t)| *t).count(), 1, "second call within the interval should not resend");
    }

    #[tokio::test]
    async fn handle_typing_ignores_self() {
        let sender = Arc::new(RecordingSender { sent: StdMutex::new(vec![]) });
        let tracker = TypingTracker::new("u1", sender, Duration::from_secs(5), Duration::from_secs(5), Duration::from_secs(8));

        tracker.handle_typing("conv1", "u1", true);
        assert!(tracker.typing_users("conv1").is_empty());
    }

    #[tokio::test]
    async fn handle_typing_tracks_and_queries() {
        let sender = Arc::new(RecordingSender { sent: StdMutex::new(vec![]) });
        let tracker = TypingTracker::new("u1", sender, Duration::from_secs(5), Duration::from_secs(5), Duration::from_secs(8));

        tracker.handle_typing("conv1", "u2", true);
        assert!(tracker.is_typing("u2", "conv1"));
        assert_eq!(tracker.typing_users("conv1"), vec!["u2".to_string()]);

        tracker.handle_typing("conv1", "u2", false);
        assert!(!tracker.is_typing("u2", "conv1"));
    }

    #[tokio::test(start_paused = true)]
    async fn handle_typing_auto_expires_after_recv_timeout() {
        let sender = Arc::new(RecordingSender { sent: StdMutex::new(vec![]) });
        let tracker = TypingTracker::new(
            "u1",
            sender,
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_millis(50),
        );

        tracker.handle_typing("conv1", "u2", true);
        assert!(tracker.is_typing("u2", "conv1"));

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;

        assert!(!tracker.is_typing("u2", "conv1"));
    }

    #[tokio::test]
    async fn dropped_listener_is_skipped_silently() {
        let sender = Arc::new(RecordingSender { sent: StdMutex::new(vec![]) });
        let tracker = TypingTracker::new("u1", sender, Duration::from_secs(5), Duration::from_secs(5), Duration::from_secs(8));

        let listener: Arc<dyn TypingListener> = Arc::new(CountingListener { changes: AtomicUsize::new(0) });
        tracker.add_listener(&listener);
        drop(listener);

        tracker.handle_typing("conv1", "u2", true);
        assert!(tracker.typing_users("conv1").contains(&"u2".to_string()));
    }
}
