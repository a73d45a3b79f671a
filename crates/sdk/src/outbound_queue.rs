//! Reliable outbound send queue. FIFO by enqueue order; guarantees the
//! server sees each enqueued message at-least-once, up to `max_retry`
//! attempts, with resend-on-reconnect since the server dedupes by
//! `client_msg_id`.
//!
//! A single reentrant lock guards the entry list; `try_process` is
//! loop-based, never recursive, so it never grows the stack with queue
//! depth.

use imcore_store::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What happened when a message was handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    NotConnected,
}

/// The transport-facing capability `OutboundQueue` needs. Abstracted so
/// tests can drive the queue without a real socket.
#[async_trait::async_trait]
pub trait SendCapability: Send + Sync {
    async fn submit(&self, message: &Message) -> SubmitOutcome;
}

/// Callbacks the queue reports back through; `on_failed` is the terminal
/// notification after `max_retry` is exhausted.
pub trait QueueObserver: Send + Sync {
    fn on_failed(&self, message: &Message);
}

struct Entry {
    message: Message,
    retry_count: u32,
    enqueue_time: Instant,
    is_sending: bool,
    last_send_time: Option<Instant>,
}

pub struct OutboundQueue {
    entries: Mutex<VecDeque<Entry>>,
    max_retry: u32,
    ack_timeout: Duration,
}

impl OutboundQueue {
    pub fn new(max_retry: u32, ack_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_retry,
            ack_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a new outbound message and attempt to submit it right away.
    pub async fn enqueue(self: &Arc<Self>, message: Message, transport: &dyn SendCapability) {
        {
            let mut entries = self.entries.lock().expect("queue poisoned");
            entries.push_back(Entry {
                message,
                retry_count: 0,
                enqueue_time: Instant::now(),
                is_sending: false,
                last_send_time: None,
            });
        }
        self.try_process(transport).await;
    }

    /// Walk entries in FIFO order, submitting every `!is_sending` entry
    /// until the transport reports `NotConnected`, at which point no
    /// further entries are attempted until the next trigger (ACK, sweep,
    /// or reconnect).
    pub async fn try_process(&self, transport: &dyn SendCapability) {
        loop {
            let next_index = {
                let entries = self.entries.lock().expect("queue poisoned");
                entries.iter().position(|e| !e.is_sending)
            };
            let Some(index) = next_index else { break };

            let message = {
                let mut entries = self.entries.lock().expect("queue poisoned");
                let entry = &mut entries[index];
                entry.is_sending = true;
                entry.last_send_time = Some(Instant::now());
                entry.message.clone()
            };

            match transport.submit(&message).await {
                SubmitOutcome::Submitted => continue,
                SubmitOutcome::NotConnected => {
                    let mut entries = self.entries.lock().expect("queue poisoned");
                    if let Some(entry) = entries.iter_mut().find(|e| e.message.client_msg_id == message.client_msg_id) {
                        entry.is_sending = false;
                    }
                    break;
                }
            }
        }
    }

    /// Remove the entry matching `client_msg_id`, returning its message
    /// (the caller updates the store row's `message_id`/`status`).
    pub async fn ack(&self, client_msg_id: &str, transport: &dyn SendCapability) -> Option<Message> {
        let removed = {
            let mut entries = self.entries.lock().expect("queue poisoned");
            let pos = entries.iter().position(|e| e.message.client_msg_id == client_msg_id)?;
            entries.remove(pos)
        };
        self.try_process(transport).await;
        removed.map(|e| e.message)
    }

    /// Periodic sweep: entries in flight longer than `ack_timeout` are
    /// retried, or failed out once `retry_count >= max_retry`.
    pub async fn sweep_timeouts(&self, transport: &dyn SendCapability, observer: &dyn QueueObserver) {
        let mut failed = Vec::new();
        {
            let mut entries = self.entries.lock().expect("queue poisoned");
            let mut i = 0;
            while i < entries.len() {
                let timed_out = entries[i].is_sending
                    && entries[i]
                        .last_send_time
                        .map(|t| t.elapsed() > self.ack_timeout)
                        .unwrap_or(false);
                if !timed_out {
                    i += 1;
                    continue;
                }
                entries[i].retry_count += 1;
                if entries[i].retry_count >= self.max_retry {
                    let entry = entries.remove(i).unwrap();
                    failed.push(entry.message);
                } else {
                    entries[i].is_sending = false;
                    i += 1;
                }
            }
        }
        for message in &failed {
            observer.on_failed(message);
        }
        self.try_process(transport).await;
    }

    /// All in-flight entries become eligible for resubmission: the server
    /// dedupes by `client_msg_id`, so replaying a message that may already
    /// have reached it before the disconnect is safe.
    pub async fn on_reconnected(&self, transport: &dyn SendCapability) {
        {
            let mut entries = self.entries.lock().expect("queue poisoned");
            for entry in entries.iter_mut() {
                entry.is_sending = false;
            }
        }
        self.try_process(transport).await;
    }

    /// Age of the oldest entry still queued, for diagnostics.
    pub fn oldest_enqueue_age(&self) -> Option<Duration> {
        let entries = self.entries.lock().expect("queue poisoned");
        entries.front().map(|e| e.enqueue_time.elapsed())
    }
}
