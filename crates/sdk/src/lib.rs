//! Session/transport runtime for a mobile instant-messaging client: framed
//! transport, connection lifecycle, a reliable outbound queue, and
//! incremental sync, layered on top of `imcore-store`'s durable local
//! store and `imcore-wire`'s wire codec.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod outbound_queue;
pub mod reconnect;
pub mod router;
pub mod seq;
pub mod session;
pub mod sync_engine;
pub mod transport;
pub mod typing;

pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use session::Session;
