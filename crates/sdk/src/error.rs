//! Error taxonomy surfaced to the host application, per the external
//! interface: protocol/transport errors trigger reconnect internally,
//! while auth/timeout/not-connected/store/terminal errors are reported
//! to the caller directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] imcore_wire::CodecError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request timed out")]
    Timeout,

    #[error("not connected")]
    NotConnected,

    #[error("store error: {0}")]
    Store(#[from] imcore_store::StoreError),

    #[error("maximum retries reached for message {client_msg_id}")]
    MaxRetriesReached { client_msg_id: String },

    #[error("maximum reconnect attempts reached")]
    MaxReconnectAttemptsReached,

    #[error("kicked out: {0}")]
    KickedOut(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
