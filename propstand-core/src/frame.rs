//! Packet framing over a byte stream
//!
//! TCP gives us a byte stream; packet boundaries are recovered from the
//! LENGTH field at header bytes 3-4. `FrameBuffer` accumulates whatever the
//! socket produced and yields complete packets one at a time. It never does
//! I/O itself, so the same code serves the server's session reader and the
//! tests.

use crate::error::ProtocolError;
use crate::packet::{HEADER_LEN, MAX_PACKET_LEN};

/// Accumulates stream bytes and yields complete packet frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_len(MAX_PACKET_LEN)
    }

    /// Cap accepted frames below the protocol maximum.
    pub fn with_max_len(max_len: usize) -> Self {
        FrameBuffer {
            buf: Vec::new(),
            max_len,
        }
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet emitted.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A LENGTH outside
    /// `HEADER_LEN..=max_len` is a fatal framing violation: the stream can
    /// no longer be resynchronized and the connection must be dropped.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([self.buf[3], self.buf[4]]) as usize;
        if length < HEADER_LEN || length > self.max_len {
            return Err(ProtocolError::BadFrameLength(length));
        }
        if self.buf.len() < length {
            return Ok(None);
        }

        let frame = self.buf.drain(..length).collect();
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Body, Packet};

    #[test]
    fn test_concatenated_packets_come_back_in_order() {
        let packets = vec![
            Packet::new(0, 1, Body::Heartbeat),
            Packet::new(1, 2, Body::StreamStart { freq_hz: 10 }),
            Packet::new(2, 3, Body::Estop),
        ];

        let mut stream = Vec::new();
        for p in &packets {
            stream.extend_from_slice(&p.encode());
        }

        let mut frames = FrameBuffer::new();
        frames.extend(&stream);

        for expected in &packets {
            let frame = frames.next_frame().unwrap().unwrap();
            assert_eq!(Packet::decode(&frame).unwrap(), *expected);
        }
        assert_eq!(frames.next_frame().unwrap(), None);
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_partial_feed_blocks_until_complete() {
        let bytes = Packet::new(7, 99, Body::StreamStart { freq_hz: 100 }).encode();

        let mut frames = FrameBuffer::new();
        for (i, byte) in bytes.iter().enumerate() {
            frames.extend(&[*byte]);
            if i + 1 < bytes.len() {
                assert_eq!(frames.next_frame().unwrap(), None);
            }
        }
        assert_eq!(frames.next_frame().unwrap().unwrap(), bytes);
    }

    #[test]
    fn test_length_below_header_is_fatal() {
        let mut frames = FrameBuffer::new();
        frames.extend(&[0x02, 0x08, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            frames.next_frame(),
            Err(ProtocolError::BadFrameLength(5))
        );
    }

    #[test]
    fn test_length_above_cap_is_fatal() {
        let mut frames = FrameBuffer::with_max_len(1024);
        frames.extend(&[0x02, 0x10, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            frames.next_frame(),
            Err(ProtocolError::BadFrameLength(0x4000))
        );
    }
}
