//! WebSocket transport variant: one binary WS frame per application
//! message, payload a Protocol-Buffer `WebSocketMessage{command, sequence,
//! body}` envelope. No 16-byte header — WebSocket already supplies framing.

use super::{Credentials, PendingSlot, TransportError, TransportEvent};
use crate::seq::SequenceGen;
use futures_util::{SinkExt, StreamExt};
use imcore_wire::command::Tag;
use imcore_wire::{pb, ws as wire_ws};
use prost::Message as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;
type PendingMap = Arc<Mutex<HashMap<u32, PendingSlot>>>;

pub struct WsTransport {
    sink: Arc<AsyncMutex<WsSink>>,
    seq_gen: Arc<SequenceGen>,
    pending: PendingMap,
    reader_task: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    pub(crate) async fn connect(
        url: &str,
        credentials: &Credentials,
        auth_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (sink, stream) = stream.split();
        let sink = Arc::new(AsyncMutex::new(sink));
        let seq_gen = Arc::new(SequenceGen::new());
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(stream, pending.clone(), events_tx.clone()));

        let mut transport = Self {
            sink,
            seq_gen,
            pending,
            reader_task,
        };

        let auth_body = pb::AuthReq {
            user_id: credentials.user_id.clone(),
            token: credentials.token.clone(),
            device_id: String::new(),
        }
        .encode_to_vec();

        let (_cmd, resp_body) = transport
            .request(Tag::AuthReq.to_u16(), auth_body, auth_timeout)
            .await?;
        let auth_rsp = pb::AuthRsp::decode(resp_body.as_slice())
            .map_err(|e| TransportError::Protocol(format!("bad AuthRsp: {e}")))?;
        if !auth_rsp.ok {
            return Err(TransportError::AuthFailed(auth_rsp.reason));
        }
        transport.seq_gen.reset();

        let _ = events_tx.send(TransportEvent::StateChanged(super::ConnectionState::Connected));
        Ok((transport, events_rx))
    }

    pub(crate) async fn disconnect(&mut self) {
        self.reader_task.abort();
        let mut pending = self.pending.lock().expect("pending map poisoned");
        for (_, slot) in pending.drain() {
            let _ = slot.send(Err(TransportError::Closed));
        }
        drop(pending);
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
    }

    pub(crate) async fn send_frame(
        &mut self,
        command: u16,
        body: Vec<u8>,
    ) -> Result<u32, TransportError> {
        let sequence = self.seq_gen.next();
        write_envelope(&self.sink, command, sequence, body).await?;
        Ok(sequence)
    }

    pub(crate) async fn request(
        &mut self,
        command: u16,
        body: Vec<u8>,
        deadline: Duration,
    ) -> Result<(u16, Vec<u8>), TransportError> {
        let sequence = self.seq_gen.next();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(sequence, tx);

        if let Err(e) = write_envelope(&self.sink, command, sequence, body).await {
            self.pending.lock().expect("pending map poisoned").remove(&sequence);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().expect("pending map poisoned").remove(&sequence);
                Err(TransportError::Timeout)
            }
        }
    }
}

async fn write_envelope(
    sink: &Arc<AsyncMutex<WsSink>>,
    command: u16,
    sequence: u32,
    body: Vec<u8>,
) -> Result<(), TransportError> {
    let encoded = wire_ws::encode_ws(command, sequence, &body);
    let mut guard = sink.lock().await;
    guard
        .send(WsMessage::Binary(encoded.into()))
        .await
        .map_err(|e| TransportError::Io(e.to_string()))
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    pending: PendingMap,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        let msg = match stream.next().await {
            None => {
                let _ = events_tx.send(TransportEvent::StateChanged(
                    super::ConnectionState::Disconnected,
                ));
                break;
            }
            Some(Err(e)) => {
                let _ = events_tx.send(TransportEvent::Error(TransportError::Io(e.to_string())));
                break;
            }
            Some(Ok(msg)) => msg,
        };

        let payload = match msg {
            WsMessage::Binary(b) => b,
            WsMessage::Close(_) => {
                let _ = events_tx.send(TransportEvent::StateChanged(
                    super::ConnectionState::Disconnected,
                ));
                break;
            }
            _ => continue,
        };

        match wire_ws::decode_ws(&payload) {
            Ok((command, sequence, body)) => {
                let slot = pending.lock().expect("pending map poisoned").remove(&sequence);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(Ok((command, body)));
                    }
                    None => {
                        let _ = events_tx.send(TransportEvent::Push {
                            command,
                            sequence,
                            body,
                        });
                    }
                }
            }
            Err(e) => {
                let _ = events_tx.send(TransportEvent::Error(TransportError::Protocol(e.to_string())));
                break;
            }
        }
    }
}
