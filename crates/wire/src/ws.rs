//! WebSocket variant: one binary WS message per application message, no
//! 16-byte header (WebSocket already supplies framing).

use crate::pb::WebSocketMessage;
use prost::Message as _;

#[derive(Debug, thiserror::Error)]
pub enum WsCodecError {
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Encode an application message as a WebSocket binary payload.
pub fn encode_ws(command: u16, sequence: u32, body: &[u8]) -> Vec<u8> {
    let envelope = WebSocketMessage {
        command: command as u32,
        sequence,
        body: body.to_vec(),
    };
    envelope.encode_to_vec()
}

/// Decode a single WebSocket binary payload into its envelope fields.
pub fn decode_ws(payload: &[u8]) -> Result<(u16, u32, Vec<u8>), WsCodecError> {
    let envelope = WebSocketMessage::decode(payload)?;
    Ok((envelope.command as u16, envelope.sequence, envelope.body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_envelope_round_trips() {
        let bytes = encode_ws(202, 9, b"hello");
        let (cmd, seq, body) = decode_ws(&bytes).unwrap();
        assert_eq!(cmd, 202);
        assert_eq!(seq, 9);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn empty_body_round_trips() {
        let bytes = encode_ws(5, 1, b"");
        let (_, _, body) = decode_ws(&bytes).unwrap();
        assert!(body.is_empty());
    }
}
