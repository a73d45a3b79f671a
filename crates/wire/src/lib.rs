//! Wire format: CRC16, frame header encode/decode, stream defragmentation,
//! the command-tag catalogue, and the Protocol-Buffer payload/envelope
//! types shared by both the TCP and WebSocket transports.

pub mod codec;
pub mod command;
pub mod crc16;
pub mod frame;
pub mod ws;

/// Generated Protocol-Buffer types (`envelope.proto`, `payloads.proto`).
pub mod pb {
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/imcore.wire.rs"));
}

pub use codec::{Codec, CodecError};
pub use command::Tag;
pub use crc16::crc16;
pub use frame::{Frame, FrameError};
