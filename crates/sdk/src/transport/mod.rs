//! Polymorphic transport: `Tcp` and `WebSocket` variants behind one
//! capability set (`connect`, `disconnect`, `send_frame`, `observe_events`),
//! implemented as a tagged enum per the dispatch note — no object-safety
//! gymnastics needed since both variants are known up front.

mod tcp;
mod ws;

pub use tcp::TcpTransport;
pub use ws::WsTransport;

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Connection lifecycle state, mirrored to observers on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: String,
    pub token: String,
}

/// Events emitted by a transport's background I/O task.
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// An inbound frame not claimed by a pending request/response slot.
    Push {
        command: u16,
        sequence: u32,
        body: Vec<u8>,
    },
    Error(TransportError),
}

/// Transport-adjacent errors propagate as plain strings rather than
/// through `thiserror`, matching the manual `Display`/`Error` impl used
/// for this family of error in the code this is grounded on.
#[derive(Debug)]
pub enum TransportError {
    Connect(String),
    Io(String),
    Protocol(String),
    AuthFailed(String),
    Timeout,
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect(s) => write!(f, "connect failed: {s}"),
            TransportError::Io(s) => write!(f, "io error: {s}"),
            TransportError::Protocol(s) => write!(f, "protocol error: {s}"),
            TransportError::AuthFailed(s) => write!(f, "auth failed: {s}"),
            TransportError::Timeout => write!(f, "timed out"),
            TransportError::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A completion registered for one outstanding request/response sequence.
pub(crate) type PendingSlot = oneshot::Sender<Result<(u16, Vec<u8>), TransportError>>;

/// Parsed connection URL: scheme picks the variant, the rest is passed
/// to the underlying dialer untouched.
pub(crate) enum Endpoint {
    Tcp { host: String, port: u16, tls: bool },
    WebSocket { url: String },
}

pub(crate) fn parse_endpoint(url: &str) -> Result<Endpoint, TransportError> {
    if let Some(rest) = url.strip_prefix("tcps://") {
        let (host, port) = split_host_port(rest)?;
        Ok(Endpoint::Tcp { host, port, tls: true })
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        let (host, port) = split_host_port(rest)?;
        Ok(Endpoint::Tcp { host, port, tls: false })
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(Endpoint::WebSocket { url: url.to_string() })
    } else {
        Err(TransportError::Connect(format!("unsupported url scheme: {url}")))
    }
}

fn split_host_port(rest: &str) -> Result<(String, u16), TransportError> {
    let host_port = rest.split('/').next().unwrap_or(rest);
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| TransportError::Connect(format!("missing port in url: {rest}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| TransportError::Connect(format!("invalid port in url: {rest}")))?;
    Ok((host.to_string(), port))
}

/// Either concrete transport, selected once at `connect` time by URL scheme.
pub enum Transport {
    Tcp(TcpTransport),
    WebSocket(WsTransport),
}

impl Transport {
    pub async fn connect(
        url: &str,
        credentials: &Credentials,
        auth_timeout: Duration,
        max_body_len: u32,
        max_buffer_len: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        match parse_endpoint(url)? {
            Endpoint::Tcp { host, port, tls } => {
                let (t, rx) = TcpTransport::connect(
                    &host,
                    port,
                    tls,
                    credentials,
                    auth_timeout,
                    max_body_len,
                    max_buffer_len,
                )
                .await?;
                Ok((Transport::Tcp(t), rx))
            }
            Endpoint::WebSocket { url } => {
                let (t, rx) = WsTransport::connect(&url, credentials, auth_timeout).await?;
                Ok((Transport::WebSocket(t), rx))
            }
        }
    }

    pub async fn disconnect(&mut self) {
        match self {
            Transport::Tcp(t) => t.disconnect().await,
            Transport::WebSocket(t) => t.disconnect().await,
        }
    }

    /// Encode and write a frame; resolves on write completion, not ACK.
    pub async fn send_frame(&mut self, command: u16, body: Vec<u8>) -> Result<u32, TransportError> {
        match self {
            Transport::Tcp(t) => t.send_frame(command, body).await,
            Transport::WebSocket(t) => t.send_frame(command, body).await,
        }
    }

    /// Send a request and await the matching-sequence response, or the
    /// given deadline, whichever comes first.
    pub async fn request(
        &mut self,
        command: u16,
        body: Vec<u8>,
        deadline: Duration,
    ) -> Result<(u16, Vec<u8>), TransportError> {
        match self {
            Transport::Tcp(t) => t.request(command, body, deadline).await,
            Transport::WebSocket(t) => t.request(command, body, deadline).await,
        }
    }
}
