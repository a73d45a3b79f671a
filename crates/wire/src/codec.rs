//! Stateful frame defragmentation over an arbitrary byte stream.
//!
//! One `Codec` belongs to exactly one `Transport`; its receive buffer is
//! never shared across connections.

use crate::frame::{self, Frame, FrameError, ParseOutcome};

pub const DEFAULT_MAX_BUFFER_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("receive buffer exceeded max_buffer_len ({0} > {1})")]
    BufferOverflow(usize, usize),
}

/// Growing receive buffer plus repeated frame extraction.
pub struct Codec {
    buf: Vec<u8>,
    max_buffer_len: usize,
    max_body_len: u32,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_LEN, frame::DEFAULT_MAX_BODY_LEN)
    }
}

impl Codec {
    pub fn new(max_buffer_len: usize, max_body_len: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_buffer_len,
            max_body_len,
        }
    }

    /// Encode a frame for transmission. Does not touch the receive buffer.
    pub fn encode(&self, command: u16, sequence: u32, body: &[u8]) -> Vec<u8> {
        frame::encode(command, sequence, body)
    }

    /// Feed a chunk of bytes arrived from the socket and drain as many
    /// complete frames as are now available, in arrival order.
    ///
    /// On a fatal parse error the codec's buffer is left as-is (the caller
    /// is expected to tear down and reopen the transport; continuing to
    /// feed it more bytes would just misparse again).
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, CodecError> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.max_buffer_len {
            return Err(CodecError::BufferOverflow(self.buf.len(), self.max_buffer_len));
        }

        let mut frames = Vec::new();
        loop {
            match frame::parse_one(&self.buf, self.max_body_len) {
                ParseOutcome::NeedMore => break,
                ParseOutcome::Fatal(e) => return Err(CodecError::Frame(e)),
                ParseOutcome::Frame { frame, consumed } => {
                    self.buf.drain(0..consumed);
                    frames.push(frame);
                }
            }
        }
        Ok(frames)
    }

    /// Number of bytes currently buffered, awaiting more data.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defragments_across_arbitrary_chunk_boundaries() {
        let f1 = frame::encode(5, 1, b"");
        let f2 = frame::encode(202, 2, b"hello");
        let f3 = frame::encode(9, 3, b"ok");
        let mut stream = Vec::new();
        stream.extend_from_slice(&f1);
        stream.extend_from_slice(&f2);
        stream.extend_from_slice(&f3);

        let mut codec = Codec::default();
        let mut got = Vec::new();
        for chunk in stream.chunks(7) {
            got.extend(codec.push(chunk).expect("no fatal errors"));
        }

        assert_eq!(got.len(), 3);
        assert_eq!(got[0].command, 5);
        assert_eq!(got[0].sequence, 1);
        assert!(got[0].body.is_empty());
        assert_eq!(got[1].command, 202);
        assert_eq!(got[1].body, b"hello");
        assert_eq!(got[2].command, 9);
        assert_eq!(got[2].body, b"ok");
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn single_byte_chunks_still_defragment() {
        let bytes = frame::encode(5, 42, b"abc");
        let mut codec = Codec::default();
        let mut got = Vec::new();
        for b in &bytes {
            got.extend(codec.push(&[*b]).expect("no fatal errors"));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sequence, 42);
    }

    #[test]
    fn fatal_error_on_bad_magic_does_not_panic() {
        let mut bytes = frame::encode(5, 1, b"x");
        bytes[0] = 0;
        let mut codec = Codec::default();
        let err = codec.push(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Frame(FrameError::BadMagic(_))));
    }

    #[test]
    fn buffer_overflow_is_reported() {
        let mut codec = Codec::new(8, frame::DEFAULT_MAX_BODY_LEN);
        let junk = vec![0u8; 9];
        let err = codec.push(&junk).unwrap_err();
        assert!(matches!(err, CodecError::BufferOverflow(9, 8)));
    }

    #[test]
    fn partial_frame_leaves_bytes_buffered() {
        let bytes = frame::encode(5, 1, b"abcdef");
        let mut codec = Codec::default();
        let got = codec.push(&bytes[..10]).unwrap();
        assert!(got.is_empty());
        assert_eq!(codec.buffered_len(), 10);
    }
}
