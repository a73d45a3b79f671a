//! Framed-TCP transport variant: raw sockets (optionally TLS-wrapped)
//! with the 16-byte header codec doing the framing.

use super::{Credentials, PendingSlot, TransportError, TransportEvent};
use crate::seq::SequenceGen;
use imcore_wire::command::Tag;
use imcore_wire::{pb, Codec};
use prost::Message as _;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

enum TcpOrTls {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for TcpOrTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpOrTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TcpOrTls::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpOrTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TcpOrTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TcpOrTls::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpOrTls::Plain(s) => Pin::new(s).poll_flush(cx),
            TcpOrTls::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpOrTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TcpOrTls::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u32, PendingSlot>>>;

pub struct TcpTransport {
    writer: Arc<AsyncMutex<tokio::io::WriteHalf<TcpOrTls>>>,
    seq_gen: Arc<SequenceGen>,
    pending: PendingMap,
    reader_task: tokio::task::JoinHandle<()>,
}

impl TcpTransport {
    pub(crate) async fn connect(
        host: &str,
        port: u16,
        tls: bool,
        credentials: &Credentials,
        auth_timeout: Duration,
        max_body_len: u32,
        max_buffer_len: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        stream.set_nodelay(true).ok();

        let stream = if tls {
            let mut roots = tokio_rustls::rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = tokio_rustls::rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| TransportError::Connect(format!("invalid TLS server name: {e}")))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| TransportError::Connect(format!("TLS handshake failed: {e}")))?;
            TcpOrTls::Tls(Box::new(tls_stream))
        } else {
            TcpOrTls::Plain(stream)
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(AsyncMutex::new(write_half));
        let seq_gen = Arc::new(SequenceGen::new());
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(
            read_half,
            pending.clone(),
            events_tx.clone(),
            max_body_len,
            max_buffer_len,
        ));

        let mut transport = Self {
            writer,
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
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }

    pub(crate) async fn send_frame(
        &mut self,
        command: u16,
        body: Vec<u8>,
    ) -> Result<u32, TransportError> {
        let sequence = self.seq_gen.next();
        write_frame(&self.writer, command, sequence, body).await?;
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

        if let Err(e) = write_frame(&self.writer, command, sequence, body).await {
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

async fn write_frame(
    writer: &Arc<AsyncMutex<tokio::io::WriteHalf<TcpOrTls>>>,
    command: u16,
    sequence: u32,
    body: Vec<u8>,
) -> Result<(), TransportError> {
    let encoded = imcore_wire::frame::encode(command, sequence, &body);
    let mut guard = writer.lock().await;
    guard
        .write_all(&encoded)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))
}

async fn read_loop(
    mut read_half: tokio::io::ReadHalf<TcpOrTls>,
    pending: PendingMap,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    max_body_len: u32,
    max_buffer_len: usize,
) {
    let mut codec = Codec::new(max_buffer_len, max_body_len);
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => {
                let _ = events_tx.send(TransportEvent::StateChanged(
                    super::ConnectionState::Disconnected,
                ));
                break;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = events_tx.send(TransportEvent::Error(TransportError::Io(e.to_string())));
                break;
            }
        };

        let frames = match codec.push(&chunk[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                let _ = events_tx.send(TransportEvent::Error(TransportError::Protocol(e.to_string())));
                break;
            }
        };

        for frame in frames {
            dispatch_frame(frame.command, frame.sequence, frame.body, &pending, &events_tx);
        }
    }
}

fn dispatch_frame(
    command: u16,
    sequence: u32,
    body: Vec<u8>,
    pending: &PendingMap,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
) {
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
