//! Incremental, seq-driven synchronization. Drives `last_sync_seq`
//! monotonically forward by requesting batches from the server and
//! persisting them, and recovers from suspected packet loss by re-running
//! sync when received `message.seq` jumps by more than the configured
//! gap threshold.

use crate::error::{SessionError, SessionResult};
use crate::transport::TransportError;
use imcore_store::{Message as StoreMessage, Store};
use imcore_wire::pb;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// The send capability `SyncEngine` needs from `Session`'s transport,
/// narrowed to the two request shapes sync uses.
#[async_trait::async_trait]
pub trait SyncTransport: Send + Sync {
    async fn sync(&self, from_seq: i64, batch_size: i32) -> Result<pb::SyncRsp, TransportError>;
    async fn sync_range(&self, from_seq: i64, to_seq: i64) -> Result<pb::SyncRangeRsp, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncProgress {
    pub current_count: usize,
    pub total_count: usize,
    pub progress: f64,
    pub current_batch: u32,
}

/// Observers learn about sync progress without `SyncEngine` holding a
/// strong reference back into UI state; `Session` is expected to register
/// one implementation per logged-in user.
pub trait SyncObserver: Send + Sync {
    fn on_progress(&self, _progress: SyncProgress) {}
    fn on_completed(&self) {}
    fn on_failed(&self, _reason: &str) {}
}

/// An observer that does nothing; used where no host callback is wired up.
pub struct NullSyncObserver;
impl SyncObserver for NullSyncObserver {}

struct EngineState {
    phase: SyncPhase,
    current_batch: u32,
    current_count: usize,
    total_estimate: usize,
}

pub struct SyncEngine<T: SyncTransport> {
    user_id: String,
    store: Arc<Store>,
    transport: Arc<T>,
    observer: Arc<dyn SyncObserver>,
    batch_size: i32,
    gap_threshold: i64,
    state: AsyncMutex<EngineState>,
}

impl<T: SyncTransport> SyncEngine<T> {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<Store>,
        transport: Arc<T>,
        observer: Arc<dyn SyncObserver>,
        batch_size: i32,
        gap_threshold: i64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            transport,
            observer,
            batch_size,
            gap_threshold,
            state: AsyncMutex::new(EngineState {
                phase: SyncPhase::Idle,
                current_batch: 0,
                current_count: 0,
                total_estimate: 0,
            }),
        }
    }

    pub async fn phase(&self) -> SyncPhase {
        self.state.lock().await.phase
    }

    /// Request everything since the persisted watermark. A call that
    /// arrives while a run is already in flight coalesces into that run
    /// rather than starting a second one.
    pub async fn start_sync(&self) -> SessionResult<()> {
        let from_seq = self.store.load_sync_state(&self.user_id)?.last_sync_seq;
        self.sync_from(from_seq).await
    }

    /// Bootstrap or forced resume from a specific watermark.
    pub async fn sync_from(&self, from_seq: i64) -> SessionResult<()> {
        {
            let mut state = self.state.lock().await;
            if state.phase == SyncPhase::Syncing {
                return Ok(());
            }
            state.phase = SyncPhase::Syncing;
            state.current_batch = 0;
            state.current_count = 0;
            state.total_estimate = 0;
        }
        self.store.set_syncing(&self.user_id, true)?;
        self.run(from_seq).await
    }

    /// Clear the watermark and any in-flight state for a full resync.
    pub async fn reset(&self) -> SessionResult<()> {
        let mut state = self.state.lock().await;
        state.phase = SyncPhase::Idle;
        state.current_batch = 0;
        state.current_count = 0;
        state.total_estimate = 0;
        drop(state);
        self.store.reset_sync_state(&self.user_id)?;
        Ok(())
    }

    async fn run(&self, mut from_seq: i64) -> SessionResult<()> {
        loop {
            let response = match self.transport.sync(from_seq, self.batch_size).await {
                Ok(r) => r,
                Err(e) => {
                    self.fail(e.to_string()).await?;
                    return Err(SessionError::Transport(e.to_string()));
                }
            };

            let has_more = response.has_more;
            let server_max_seq = response.server_max_seq;
            let messages: Vec<StoreMessage> = response
                .messages
                .into_iter()
                .map(crate::router::from_pb_message)
                .collect();

            let continuation = self
                .handle_sync_response(messages, has_more, server_max_seq)
                .await?;

            match continuation {
                Some(next_from_seq) => from_seq = next_from_seq,
                None => return Ok(()),
            }
        }
    }

    /// Persist one batch and advance the watermark. Returns `Some(next
    /// from_seq)` when the caller should request another batch, `None`
    /// once the run has completed.
    pub async fn handle_sync_response(
        &self,
        messages: Vec<StoreMessage>,
        has_more: bool,
        server_max_seq: i64,
    ) -> SessionResult<Option<i64>> {
        let batch_max_seq = messages.iter().map(|m| m.seq).max();

        if !messages.is_empty() {
            self.store.save_messages(&messages)?;
        }
        if let Some(max_seq) = batch_max_seq {
            self.store.advance_sync_watermark(&self.user_id, max_seq, now_ms())?;
        }

        let mut state = self.state.lock().await;
        state.current_batch += 1;
        state.current_count += messages.len();
        if state.total_estimate == 0 && server_max_seq > 0 {
            let from = self.store.load_sync_state(&self.user_id)?.last_sync_seq;
            state.total_estimate = (server_max_seq - from).max(0) as usize;
        }
        let progress = SyncProgress {
            current_count: state.current_count,
            total_count: state.total_estimate,
            progress: if state.total_estimate == 0 {
                1.0
            } else {
                (state.current_count as f64 / state.total_estimate as f64).min(1.0)
            },
            current_batch: state.current_batch,
        };
        let batch_max_seq = batch_max_seq.unwrap_or(0);
        drop(state);
        self.observer.on_progress(progress);

        if has_more {
            Ok(Some(batch_max_seq + 1))
        } else {
            let mut state = self.state.lock().await;
            state.phase = SyncPhase::Completed;
            drop(state);
            self.store.set_syncing(&self.user_id, false)?;
            self.observer.on_completed();
            Ok(None)
        }
    }

    /// Same as `handle_sync_response`, for a bounded `[from_seq, to_seq]`
    /// range rather than the open-ended tail.
    pub async fn handle_sync_range_response(
        &self,
        messages: Vec<StoreMessage>,
        has_more: bool,
        to_seq: i64,
    ) -> SessionResult<()> {
        let batch_max_seq = messages.iter().map(|m| m.seq).max();
        if !messages.is_empty() {
            self.store.save_messages(&messages)?;
        }
        if let Some(max_seq) = batch_max_seq {
            self.store.advance_sync_watermark(&self.user_id, max_seq, now_ms())?;
        }
        if !has_more {
            let mut state = self.state.lock().await;
            state.phase = SyncPhase::Completed;
            drop(state);
            self.store.set_syncing(&self.user_id, false)?;
            self.observer.on_completed();
        } else if let Some(max_seq) = batch_max_seq {
            if max_seq < to_seq {
                let response = self
                    .transport
                    .sync_range(max_seq + 1, to_seq)
                    .await
                    .map_err(|e| SessionError::Transport(e.to_string()))?;
                let messages: Vec<StoreMessage> = response
                    .messages
                    .into_iter()
                    .map(crate::router::from_pb_message)
                    .collect();
                return Box::pin(self.handle_sync_range_response(messages, response.has_more, to_seq)).await;
            }
        }
        Ok(())
    }

    async fn fail(&self, reason: String) -> SessionResult<()> {
        let mut state = self.state.lock().await;
        state.phase = SyncPhase::Failed;
        drop(state);
        self.store.set_syncing(&self.user_id, false)?;
        self.observer.on_failed(&reason);
        Ok(())
    }

    /// Per the packet-loss heuristic: a gap larger than `gap_threshold`
    /// between consecutive received `message.seq` values on pushes (not
    /// frame `sequence`) is suspicious enough to warrant an immediate
    /// resync rather than waiting on the at-least-once replay built into
    /// the outbound queue and server.
    pub fn seq_gap_exceeds_threshold(&self, previous_seq: i64, incoming_seq: i64) -> bool {
        incoming_seq - previous_seq > self.gap_threshold
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sample(seq: i64) -> pb::Message {
        pb::Message {
            message_id: format!("m{seq}"),
            client_msg_id: format!("c{seq}"),
            conversation_id: "conv1".to_string(),
            conversation_type: pb::ConversationType::Single as i32,
            sender_id: "peer".to_string(),
            receiver_id: "u1".to_string(),
            seq,
            ..Default::default()
        }
    }

    struct ScriptedTransport {
        batches: Mutex<Vec<pb::SyncRsp>>,
    }

    #[async_trait::async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn sync(&self, _from_seq: i64, _batch_size: i32) -> Result<pb::SyncRsp, TransportError> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                return Ok(pb::SyncRsp {
                    messages: vec![],
                    has_more: false,
                    server_max_seq: 0,
                });
            }
            Ok(batches.remove(0))
        }

        async fn sync_range(&self, _from_seq: i64, _to_seq: i64) -> Result<pb::SyncRangeRsp, TransportError> {
            Ok(pb::SyncRangeRsp {
                messages: vec![],
                has_more: false,
            })
        }
    }

    #[tokio::test]
    async fn start_sync_persists_batches_and_advances_watermark() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let transport = Arc::new(ScriptedTransport {
            batches: Mutex::new(vec![
                pb::SyncRsp {
                    messages: vec![sample(101), sample(102)],
                    has_more: true,
                    server_max_seq: 250,
                },
                pb::SyncRsp {
                    messages: (103..=250).map(sample).collect(),
                    has_more: false,
                    server_max_seq: 250,
                },
            ]),
        });
        let engine = SyncEngine::new(
            "u1",
            store.clone(),
            transport,
            Arc::new(NullSyncObserver),
            500,
            3,
        );

        engine.start_sync().await.unwrap();

        let state = store.load_sync_state("u1").unwrap();
        assert_eq!(state.last_sync_seq, 250);
        assert!(!state.is_syncing);
        assert_eq!(engine.phase().await, SyncPhase::Completed);

        let rows = store.get_messages_by_seq("conv1", i64::MAX, 500).unwrap();
        assert_eq!(rows.len(), 150);
    }

    #[tokio::test]
    async fn concurrent_start_sync_coalesces() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let transport = Arc::new(ScriptedTransport {
            batches: Mutex::new(vec![pb::SyncRsp {
                messages: vec![],
                has_more: false,
                server_max_seq: 0,
            }]),
        });
        let engine = Arc::new(SyncEngine::new(
            "u1",
            store,
            transport,
            Arc::new(NullSyncObserver),
            500,
            3,
        ));

        {
            let mut state = engine.state.lock().await;
            state.phase = SyncPhase::Syncing;
        }
        engine.start_sync().await.unwrap();
        assert_eq!(engine.phase().await, SyncPhase::Syncing, "second call must not reset an in-flight run");
    }

    #[tokio::test]
    async fn reset_rewinds_watermark() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.advance_sync_watermark("u1", 500, 1000).unwrap();
        let transport = Arc::new(ScriptedTransport {
            batches: Mutex::new(vec![]),
        });
        let engine = SyncEngine::new("u1", store.clone(), transport, Arc::new(NullSyncObserver), 500, 3);

        engine.reset().await.unwrap();

        assert_eq!(store.load_sync_state("u1").unwrap().last_sync_seq, 0);
        assert_eq!(engine.phase().await, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn gap_heuristic_flags_large_jumps_only() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let transport = Arc::new(ScriptedTransport { batches: Mutex::new(vec![]) });
        let engine = SyncEngine::new("u1", store, transport, Arc::new(NullSyncObserver), 500, 3);

        assert!(!engine.seq_gap_exceeds_threshold(100, 102));
        assert!(!engine.seq_gap_exceeds_threshold(100, 103));
        assert!(engine.seq_gap_exceeds_threshold(100, 104));
    }
}
