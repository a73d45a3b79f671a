//! Liveness probing. `Session` ticks this once per `heartbeat_interval`
//! while connected; a probe that doesn't get a response within
//! `heartbeat_timeout` raises [`HeartbeatTimeout`], which `Session` turns
//! into a reconnect.

use crate::transport::{Transport, TransportError};
use imcore_wire::command::Tag;
use imcore_wire::pb;
use prost::Message as _;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTimeout;

/// Send one heartbeat probe and wait up to `timeout` for the matching
/// response. The WebSocket variant uses this same application-layer probe
/// rather than protocol ping/pong, per the single-heartbeat-mechanism
/// decision (running both would double-trigger timeouts).
pub async fn probe(transport: &mut Transport, timeout: Duration) -> Result<(), HeartbeatTimeout> {
    let body = pb::HeartbeatReq {}.encode_to_vec();
    match transport.request(Tag::HeartbeatReq.to_u16(), body, timeout).await {
        Ok(_) => Ok(()),
        Err(TransportError::Timeout) => Err(HeartbeatTimeout),
        Err(_) => Err(HeartbeatTimeout),
    }
}
