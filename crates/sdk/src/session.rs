//! Orchestrates transport, heartbeat, reconnect, the outbound queue, and
//! sync into one authenticated connection lifecycle. This is the only
//! type a host application constructs directly.

use crate::config::SessionConfig;
use crate::dispatcher::{Dispatcher, DispatchOutcome, NullSessionObserver, SessionObserver};
use crate::error::{SessionError, SessionResult};
use crate::heartbeat;
use crate::outbound_queue::{OutboundQueue, SendCapability, SubmitOutcome};
use crate::reconnect::Reconnector;
use crate::router::{self, RouterEvent};
use crate::sync_engine::{NullSyncObserver, SyncEngine, SyncObserver, SyncTransport};
use crate::transport::{Credentials, Transport, TransportError, TransportEvent};
use crate::typing::{TypingSender, TypingTracker};
use imcore_store::{Message as StoreMessage, Store};
use imcore_wire::command::Tag;
use imcore_wire::pb;
use prost::Message as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Shared handle to the active transport, implementing every capability
/// the outbound queue, sync engine, and typing tracker each need. A single
/// `Transport` has one owner (`Session`); everyone else reaches it through
/// this handle rather than holding their own reference. Survives a
/// reconnect: the slot is swapped in place, so existing `Arc<SyncEngine>`/
/// `Arc<OutboundQueue>` instances keep working against the new connection.
#[derive(Clone)]
struct TransportHandle {
    inner: Arc<AsyncMutex<Option<Transport>>>,
    request_timeout: std::time::Duration,
}

impl TransportHandle {
    async fn is_connected(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    async fn request(&self, command: u16, body: Vec<u8>) -> Result<(u16, Vec<u8>), TransportError> {
        let mut guard = self.inner.lock().await;
        let transport = guard.as_mut().ok_or(TransportError::Closed)?;
        transport.request(command, body, self.request_timeout).await
    }

    async fn send_frame(&self, command: u16, body: Vec<u8>) -> Result<u32, TransportError> {
        let mut guard = self.inner.lock().await;
        let transport = guard.as_mut().ok_or(TransportError::Closed)?;
        transport.send_frame(command, body).await
    }
}

#[async_trait::async_trait]
impl SendCapability for TransportHandle {
    async fn submit(&self, message: &StoreMessage) -> SubmitOutcome {
        let body = pb::SendMsgReq {
            message: Some(router::to_pb_message(message)),
        }
        .encode_to_vec();
        match self.send_frame(Tag::SendMsgReq.to_u16(), body).await {
            Ok(_) => SubmitOutcome::Submitted,
            Err(_) => SubmitOutcome::NotConnected,
        }
    }
}

#[async_trait::async_trait]
impl SyncTransport for TransportHandle {
    async fn sync(&self, from_seq: i64, batch_size: i32) -> Result<pb::SyncRsp, TransportError> {
        let body = pb::SyncReq { from_seq, batch_size }.encode_to_vec();
        let (_, resp) = self.request(Tag::SyncReq.to_u16(), body).await?;
        pb::SyncRsp::decode(resp.as_slice()).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn sync_range(&self, from_seq: i64, to_seq: i64) -> Result<pb::SyncRangeRsp, TransportError> {
        let body = pb::SyncRangeReq { from_seq, to_seq }.encode_to_vec();
        let (_, resp) = self.request(Tag::SyncRangeReq.to_u16(), body).await?;
        pb::SyncRangeRsp::decode(resp.as_slice()).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

#[async_trait::async_trait]
impl TypingSender for TransportHandle {
    async fn send_typing_frame(&self, conversation_id: &str, is_typing: bool) {
        let body = pb::TypingPush {
            conversation_id: conversation_id.to_string(),
            user_id: String::new(),
            is_typing,
        }
        .encode_to_vec();
        let _ = self.send_frame(Tag::TypingPush.to_u16(), body).await;
    }
}

/// Everything a fresh connection attempt needs, bundled so
/// `run_event_loop`/`heartbeat_loop`/`reconnect_loop` can hand it to each
/// other without an ever-growing parameter list. Cheap to clone: every
/// field is an `Arc`, a `String`, or a plain `Copy`/small struct.
#[derive(Clone)]
struct ReconnectBundle {
    transport_slot: Arc<AsyncMutex<Option<Transport>>>,
    reconnector: Arc<AsyncMutex<Reconnector>>,
    auto_reconnect: Arc<AtomicBool>,
    url: String,
    credentials: Credentials,
    config: SessionConfig,
    outbound_queue: Arc<OutboundQueue>,
    sync_engine: Arc<SyncEngine<TransportHandle>>,
    dispatcher: Arc<Dispatcher>,
    typing: Arc<TypingTracker<TransportHandle>>,
    tasks: Arc<AsyncMutex<Vec<JoinHandle<()>>>>,
}

impl ReconnectBundle {
    fn transport_handle(&self) -> TransportHandle {
        TransportHandle {
            inner: self.transport_slot.clone(),
            request_timeout: self.config.ack_timeout,
        }
    }
}

/// Everything created fresh on `login` and torn down on `logout`.
struct Active {
    user_id: String,
    store: Arc<Store>,
    transport: TransportHandle,
    outbound_queue: Arc<OutboundQueue>,
    sync_engine: Arc<SyncEngine<TransportHandle>>,
    typing: Arc<TypingTracker<TransportHandle>>,
    dispatcher: Arc<Dispatcher>,
    reconnector: Arc<AsyncMutex<Reconnector>>,
    auto_reconnect: Arc<AtomicBool>,
    credentials: Credentials,
    tasks: Arc<AsyncMutex<Vec<JoinHandle<()>>>>,
}

impl Active {
    async fn shutdown(self) {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let mut guard = self.transport.inner.lock().await;
        if let Some(mut transport) = guard.take() {
            transport.disconnect().await;
        }
    }
}

pub struct Session {
    base_dir: PathBuf,
    url: String,
    config: SessionConfig,
    observer: Arc<dyn SessionObserver>,
    sync_observer: Arc<dyn SyncObserver>,
    active: AsyncMutex<Option<Active>>,
}

impl Session {
    pub fn new(url: impl Into<String>, base_dir: PathBuf, config: SessionConfig) -> Self {
        Self {
            base_dir,
            url: url.into(),
            config,
            observer: Arc::new(NullSessionObserver),
            sync_observer: Arc::new(NullSyncObserver),
            active: AsyncMutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_sync_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.sync_observer = observer;
        self
    }

    /// Open the local store, connect, authenticate, and (on success) start
    /// heartbeat, ACK sweeping, WAL checkpointing, and an initial
    /// incremental sync.
    pub async fn login(&self, user_id: &str, token: &str) -> SessionResult<()> {
        let mut guard = self.active.lock().await;
        if let Some(old) = guard.take() {
            old.shutdown().await;
        }

        let db_path = self.base_dir.join(format!("{user_id}.sqlite3"));
        let store = Arc::new(Store::open(&db_path)?);
        let credentials = Credentials {
            user_id: user_id.to_string(),
            token: token.to_string(),
        };

        let (transport, events_rx) = Transport::connect(
            &self.url,
            &credentials,
            self.config.auth_timeout,
            self.config.max_body_len,
            self.config.max_buffer_len,
        )
        .await
        .map_err(|e| match e {
            TransportError::AuthFailed(reason) => SessionError::Auth(reason),
            TransportError::Timeout => SessionError::Timeout,
            other => SessionError::Transport(other.to_string()),
        })?;

        let transport_slot = Arc::new(AsyncMutex::new(Some(transport)));
        let transport_handle = TransportHandle {
            inner: transport_slot.clone(),
            request_timeout: self.config.ack_timeout,
        };

        let outbound_queue = Arc::new(OutboundQueue::new(self.config.max_retry, self.config.ack_timeout));
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), self.observer.clone()));
        let sync_engine = Arc::new(SyncEngine::new(
            user_id,
            store.clone(),
            Arc::new(transport_handle.clone()),
            self.sync_observer.clone(),
            self.config.sync_batch_size as i32,
            self.config.sync_gap_threshold,
        ));
        let typing = TypingTracker::new(
            user_id,
            Arc::new(transport_handle.clone()),
            self.config.typing_send_interval,
            self.config.typing_stop_delay,
            self.config.typing_recv_timeout,
        );
        let reconnector = Arc::new(AsyncMutex::new(Reconnector::new(
            self.config.reconnect_base,
            self.config.reconnect_max_attempts,
        )));
        let auto_reconnect = Arc::new(AtomicBool::new(true));
        let tasks: Arc<AsyncMutex<Vec<JoinHandle<()>>>> = Arc::new(AsyncMutex::new(Vec::new()));

        let bundle = ReconnectBundle {
            transport_slot,
            reconnector: reconnector.clone(),
            auto_reconnect: auto_reconnect.clone(),
            url: self.url.clone(),
            credentials: credentials.clone(),
            config: self.config.clone(),
            outbound_queue: outbound_queue.clone(),
            sync_engine: sync_engine.clone(),
            dispatcher: dispatcher.clone(),
            typing: typing.clone(),
            tasks: tasks.clone(),
        };

        {
            let mut guard = tasks.lock().await;
            guard.push(tokio::spawn(run_event_loop(events_rx, transport_handle.clone(), bundle.clone())));
            guard.push(tokio::spawn(heartbeat_loop(
                bundle.clone(),
                self.config.heartbeat_interval,
                self.config.heartbeat_timeout,
            )));
            guard.push(tokio::spawn(ack_sweep_loop(
                outbound_queue.clone(),
                transport_handle.clone(),
                store.clone(),
                self.observer.clone(),
                self.config.ack_sweep_interval,
            )));
            guard.push(tokio::spawn(checkpoint_loop(store.clone())));
        }

        outbound_queue.on_reconnected(&transport_handle).await;
        sync_engine.start_sync().await?;

        *guard = Some(Active {
            user_id: user_id.to_string(),
            store,
            transport: transport_handle,
            outbound_queue,
            sync_engine,
            typing,
            dispatcher,
            reconnector,
            auto_reconnect,
            credentials,
            tasks,
        });
        Ok(())
    }

    /// Disable auto-reconnect, cancel pending requests, stop heartbeat, and
    /// close the transport and store.
    pub async fn logout(&self) -> SessionResult<()> {
        let mut guard = self.active.lock().await;
        if let Some(active) = guard.take() {
            active.shutdown().await;
        }
        Ok(())
    }

    /// Hand a message to the outbound queue; it is submitted immediately
    /// if connected, otherwise it waits for the next successful connect.
    /// `client_msg_id` is generated here when the caller leaves it empty,
    /// since it must be stable across retries and unique per device.
    pub async fn send_message(&self, mut message: StoreMessage) -> SessionResult<()> {
        let guard = self.active.lock().await;
        let active = guard.as_ref().ok_or(SessionError::NotConnected)?;
        if message.client_msg_id.is_empty() {
            message.client_msg_id = uuid::Uuid::new_v4().to_string();
        }
        active.store.save_message(&message)?;
        active.outbound_queue.enqueue(message, &active.transport).await;
        Ok(())
    }

    pub async fn store(&self) -> SessionResult<Arc<Store>> {
        let guard = self.active.lock().await;
        guard.as_ref().map(|a| a.store.clone()).ok_or(SessionError::NotConnected)
    }

    pub async fn current_user_id(&self) -> Option<String> {
        let guard = self.active.lock().await;
        guard.as_ref().map(|a| a.user_id.clone())
    }

    pub async fn send_typing(&self, conversation_id: &str) -> SessionResult<()> {
        let guard = self.active.lock().await;
        let active = guard.as_ref().ok_or(SessionError::NotConnected)?;
        active.typing.send_typing(conversation_id).await;
        Ok(())
    }

    /// External signal: network connectivity returned. Triggers a
    /// reconnect if currently logged in but disconnected.
    pub async fn on_network_up(&self) {
        let guard = self.active.lock().await;
        if let Some(active) = guard.as_ref() {
            if !active.transport.is_connected().await && active.auto_reconnect.load(Ordering::SeqCst) {
                let bundle = ReconnectBundle {
                    transport_slot: active.transport.inner.clone(),
                    reconnector: active.reconnector.clone(),
                    auto_reconnect: active.auto_reconnect.clone(),
                    url: self.url.clone(),
                    credentials: active.credentials.clone(),
                    config: self.config.clone(),
                    outbound_queue: active.outbound_queue.clone(),
                    sync_engine: active.sync_engine.clone(),
                    dispatcher: active.dispatcher.clone(),
                    typing: active.typing.clone(),
                    tasks: active.tasks.clone(),
                };
                tokio::spawn(reconnect_loop(bundle));
            }
        }
    }

    /// External signal: app came to the foreground. Same effect as
    /// `on_network_up` while logged in but disconnected.
    pub async fn on_app_active(&self) {
        self.on_network_up().await;
    }
}

async fn run_event_loop(
    mut events_rx: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    transport: TransportHandle,
    bundle: ReconnectBundle,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            TransportEvent::StateChanged(_) => {}
            TransportEvent::Error(e) => {
                tracing::warn!(error = %e, "transport error, scheduling reconnect");
                if bundle.auto_reconnect.load(Ordering::SeqCst) {
                    tokio::spawn(reconnect_loop(bundle.clone()));
                }
                return;
            }
            TransportEvent::Push { command, sequence: _, body } => {
                if command == Tag::SendMsgRsp.to_u16() {
                    if let Ok(rsp) = pb::SendMsgRsp::decode(body.as_slice()) {
                        if let Some(message) = bundle.outbound_queue.ack(&rsp.client_msg_id, &transport).await {
                            let _ = bundle.dispatcher.apply_send_ack(message, rsp.message_id, rsp.server_time, rsp.seq);
                        }
                    }
                    continue;
                }

                // HeartbeatRsp, SyncRsp, SyncRangeRsp never arrive here: each
                // is requested through `Transport::request`, which resolves
                // the matching pending slot internally rather than emitting
                // a push event.
                match router::route(command, &body) {
                    Ok(RouterEvent::TypingPush { conversation_id, user_id, is_typing }) => {
                        // Typing state tracking (with its auto-expiry) lives
                        // in `TypingTracker`; routed here directly instead of
                        // through `Dispatcher` so hosts observe it via
                        // `TypingListener`, not `SessionObserver`.
                        bundle.typing.handle_typing(&conversation_id, &user_id, is_typing);
                    }
                    Ok(event) => match bundle.dispatcher.dispatch(event) {
                        Ok(DispatchOutcome::KickedOut { .. }) => {
                            bundle.auto_reconnect.store(false, Ordering::SeqCst);
                            let mut guard = transport.inner.lock().await;
                            if let Some(mut t) = guard.take() {
                                t.disconnect().await;
                            }
                            return;
                        }
                        Ok(DispatchOutcome::Handled) => {}
                        Err(e) => tracing::warn!(error = %e, "dispatch failed"),
                    },
                    Err(e) => tracing::warn!(error = %e, "failed to decode pushed frame"),
                }
            }
        }
    }
}

/// Retry with backoff until a new connection is established, then swap it
/// into the shared slot, replay the outbound queue, resync, and respawn
/// `run_event_loop` against the new connection's event channel.
async fn reconnect_loop(bundle: ReconnectBundle) {
    loop {
        if !bundle.auto_reconnect.load(Ordering::SeqCst) {
            return;
        }
        let delay = {
            let mut r = bundle.reconnector.lock().await;
            match r.next_delay() {
                Ok(d) => d,
                Err(_) => {
                    tracing::error!("maximum reconnect attempts reached, giving up");
                    return;
                }
            }
        };
        tokio::time::sleep(delay).await;
        if !bundle.auto_reconnect.load(Ordering::SeqCst) {
            return;
        }

        match Transport::connect(
            &bundle.url,
            &bundle.credentials,
            bundle.config.auth_timeout,
            bundle.config.max_body_len,
            bundle.config.max_buffer_len,
        )
        .await
        {
            Ok((new_transport, events_rx)) => {
                {
                    let mut guard = bundle.transport_slot.lock().await;
                    *guard = Some(new_transport);
                }
                bundle.reconnector.lock().await.reset();

                let transport_handle = bundle.transport_handle();
                bundle.outbound_queue.on_reconnected(&transport_handle).await;
                if let Err(e) = bundle.sync_engine.start_sync().await {
                    tracing::warn!(error = %e, "post-reconnect sync failed");
                }

                let handle = tokio::spawn(run_event_loop(events_rx, transport_handle, bundle.clone()));
                bundle.tasks.lock().await.push(handle);
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "reconnect attempt failed, retrying");
                continue;
            }
        }
    }
}

async fn heartbeat_loop(bundle: ReconnectBundle, interval: std::time::Duration, timeout: std::time::Duration) {
    let transport = bundle.transport_handle();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !bundle.auto_reconnect.load(Ordering::SeqCst) {
            continue;
        }
        if !transport.is_connected().await {
            continue;
        }

        let probe_result = {
            let mut guard = transport.inner.lock().await;
            let Some(t) = guard.as_mut() else { continue };
            heartbeat::probe(t, timeout).await
        };

        if probe_result.is_err() {
            tracing::warn!("heartbeat timed out, reconnecting");
            let mut guard = transport.inner.lock().await;
            if let Some(mut t) = guard.take() {
                t.disconnect().await;
            }
            drop(guard);
            if bundle.auto_reconnect.load(Ordering::SeqCst) {
                tokio::spawn(reconnect_loop(bundle.clone()));
            }
        }
    }
}

async fn ack_sweep_loop(
    queue: Arc<OutboundQueue>,
    transport: TransportHandle,
    store: Arc<Store>,
    observer: Arc<dyn SessionObserver>,
    interval: std::time::Duration,
) {
    struct FailureReporter {
        store: Arc<Store>,
        observer: Arc<dyn SessionObserver>,
    }
    impl crate::outbound_queue::QueueObserver for FailureReporter {
        fn on_failed(&self, message: &StoreMessage) {
            tracing::warn!(client_msg_id = %message.client_msg_id, "message exceeded max retry, reporting failed");
            let mut failed = message.clone();
            failed.status = imcore_store::MessageStatus::Failed;
            if let Err(e) = self.store.save_message(&failed) {
                tracing::warn!(error = %e, client_msg_id = %message.client_msg_id, "failed to persist failed status");
            }
            self.observer.on_message_failed(&failed);
        }
    }

    let reporter = FailureReporter { store, observer };
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        queue.sweep_timeouts(&transport, &reporter).await;
    }
}

/// Collapse the WAL into the main database file periodically, so a
/// client that stays logged in for a long foreground session doesn't let
/// the `-wal` file grow unbounded.
async fn checkpoint_loop(store: Arc<Store>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
    loop {
        ticker.tick().await;
        if let Err(e) = store.checkpoint() {
            tracing::warn!(error = %e, "wal checkpoint failed");
        }
    }
}
