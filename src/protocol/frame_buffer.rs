//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: scan for the magic tag, then need 32 bytes
//! - `WaitingForTrailer`: header parsed, need ExtSize + BodySize more bytes
//!
//! Bytes that do not start with the magic tag are discarded, which lets the
//! decoder recover from a corrupted or misaligned stream.
//!
//! # Example
//!
//! ```
//! use rawrpc::protocol::{encode_message, FrameBuffer, Message, DEFAULT_MAX_BODY_SIZE};
//!
//! let frame = encode_message(&Message::push(1, "hi"), DEFAULT_MAX_BODY_SIZE).unwrap();
//!
//! let mut buffer = FrameBuffer::new();
//! let mut data = b"noise".to_vec();
//! data.extend_from_slice(&frame);
//!
//! let messages = buffer.push(&data);
//! assert_eq!(messages.len(), 1);
//! assert_eq!(buffer.discarded(), 5);
//! ```

use bytes::BytesMut;
use tracing::warn;

use super::frame::Message;
use super::wire_format::{Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE, MAGIC_TAG};

/// Bytes kept at the tail while scanning, since they may be a partial tag.
const MAGIC_TAIL: usize = 3;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Scanning for a tag and a complete header.
    WaitingForHeader,
    /// Header parsed, waiting for ext and body bytes.
    WaitingForTrailer { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete messages.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum accepted body size.
    max_body_size: u32,
    /// Total noise bytes dropped while resynchronizing.
    discarded: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default 64 MB body limit.
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a new frame buffer with a custom body limit.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_body_size,
            discarded: 0,
        }
    }

    /// Push data into the buffer and extract all complete messages.
    pub fn push(&mut self, data: &[u8]) -> Vec<Message> {
        self.extend(data);

        let mut messages = Vec::new();
        while let Some(msg) = self.next_message() {
            messages.push(msg);
        }
        messages
    }

    /// Append data to the buffer without extracting messages.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract a single message. `None` means more data is needed.
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    if !self.align_to_magic() || self.buffer.len() < HEADER_SIZE {
                        return None;
                    }

                    let header = Header::decode(&self.buffer[..HEADER_SIZE])?;
                    if header.body_size > self.max_body_size {
                        // The tag bytes occurred inside noise; skip past them.
                        warn!(
                            body_size = header.body_size,
                            max = self.max_body_size,
                            "Oversized body in header, resyncing"
                        );
                        self.discard(1);
                        continue;
                    }

                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForTrailer { header };
                }

                State::WaitingForTrailer { header } => {
                    let header = *header;
                    if self.buffer.len() < header.trailer_len() {
                        return None;
                    }

                    let ext = self.buffer.split_to(header.ext_size as usize).freeze();
                    let body = self.buffer.split_to(header.body_size as usize).freeze();
                    self.state = State::WaitingForHeader;

                    return Some(Message::from_parts(header, ext, body));
                }
            }
        }
    }

    /// Drop leading bytes until the buffer starts with the tag.
    ///
    /// Returns `false` when no complete tag is buffered yet.
    fn align_to_magic(&mut self) -> bool {
        let tag = MAGIC_TAG.to_le_bytes();
        match self.buffer.windows(tag.len()).position(|w| w == tag) {
            Some(0) => true,
            Some(pos) => {
                warn!(skipped = pos, "Discarding bytes before magic tag");
                self.discard(pos);
                true
            }
            None => {
                let excess = self.buffer.len().saturating_sub(MAGIC_TAIL);
                if excess > 0 {
                    warn!(skipped = excess, "No magic tag in buffer, discarding");
                    self.discard(excess);
                }
                false
            }
        }
    }

    fn discard(&mut self, n: usize) {
        let _ = self.buffer.split_to(n);
        self.discarded += n as u64;
    }

    /// Total number of noise bytes dropped so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a header has been parsed and its trailer is still incomplete.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, State::WaitingForTrailer { .. })
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_message;

    fn frame_bytes(command: u32, seq: u32, body: &[u8]) -> Vec<u8> {
        let msg = Message::request(command, body.to_vec()).with_sequence(seq);
        encode_message(&msg, DEFAULT_MAX_BODY_SIZE).unwrap().to_vec()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let messages = buffer.push(&frame_bytes(1, 42, b"hello"));

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].command, 1);
        assert_eq!(messages[0].sequence, 42);
        assert_eq!(&messages[0].body[..], b"hello");
        assert!(buffer.is_empty());
        assert_eq!(buffer.discarded(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = frame_bytes(1, 1, b"first");
        combined.extend_from_slice(&frame_bytes(2, 2, b"second"));
        combined.extend_from_slice(&frame_bytes(3, 3, b"third"));

        let messages = buffer.push(&combined);
        let commands: Vec<u32> = messages.iter().map(|m| m.command).collect();
        assert_eq!(commands, vec![1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_bytes(1, 42, b"test");

        assert!(buffer.push(&bytes[..5]).is_empty());
        assert!(!buffer.is_mid_frame());

        let messages = buffer.push(&bytes[5..]);
        assert_eq!(messages.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let body = b"this is a longer body that will be fragmented";
        let bytes = frame_bytes(1, 42, body);

        let split = HEADER_SIZE + 10;
        assert!(buffer.push(&bytes[..split]).is_empty());
        assert!(buffer.is_mid_frame());

        let messages = buffer.push(&bytes[split..]);
        assert_eq!(&messages[0].body[..], body);
    }

    #[test]
    fn test_empty_body_and_ext() {
        let mut buffer = FrameBuffer::new();
        let messages = buffer.push(&frame_bytes(1, 42, b""));

        assert_eq!(messages.len(), 1);
        assert!(messages[0].body.is_empty());
        assert!(messages[0].ext.is_empty());
    }

    #[test]
    fn test_ext_and_body_split() {
        let msg = Message::push(8, "payload").with_ext("meta");
        let bytes = encode_message(&msg, DEFAULT_MAX_BODY_SIZE).unwrap();

        let mut buffer = FrameBuffer::new();
        assert_eq!(buffer.push(&bytes), vec![msg]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_bytes(1, 42, b"hi");

        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(buffer.push(&[*byte]));
        }

        assert_eq!(all.len(), 1);
        assert_eq!(&all[0].body[..], b"hi");
    }

    #[test]
    fn test_resync_after_garbage_prefix() {
        let mut buffer = FrameBuffer::new();
        let mut data = vec![0x00, 0xFF, 0x13, 0x37, 0x42, 0x99, 0x01];
        data.extend_from_slice(&frame_bytes(5, 9, b"ok"));

        let messages = buffer.push(&data);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].command, 5);
        assert_eq!(buffer.discarded(), 7);
    }

    #[test]
    fn test_resync_between_frames() {
        let mut buffer = FrameBuffer::new();
        let mut data = frame_bytes(1, 1, b"a");
        data.extend_from_slice(b"garbage!");
        data.extend_from_slice(&frame_bytes(2, 2, b"b"));

        let messages = buffer.push(&data);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].command, 2);
        assert_eq!(buffer.discarded(), 8);
    }

    #[test]
    fn test_partial_tag_kept_across_pushes() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_bytes(3, 3, b"x");

        // Noise followed by the first two tag bytes.
        let mut first = vec![0xAA; 10];
        first.extend_from_slice(&bytes[..2]);
        assert!(buffer.push(&first).is_empty());
        assert!(buffer.len() <= MAGIC_TAIL);

        let messages = buffer.push(&bytes[2..]);
        assert_eq!(messages.len(), 1);
        assert_eq!(buffer.discarded(), 10);
    }

    #[test]
    fn test_oversized_body_treated_as_false_tag() {
        let mut buffer = FrameBuffer::with_max_body(100);

        let fake = Header {
            command: 1,
            pkg_type: crate::protocol::PkgType::Request,
            result: 0,
            sequence: 0,
            req_id: 0,
            body_size: 1000,
            ext_size: 0,
        };
        let mut data = fake.encode().to_vec();
        data.extend_from_slice(&frame_bytes(7, 1, b"real"));

        let messages = buffer.push(&data);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].command, 7);
        assert_eq!(buffer.discarded(), HEADER_SIZE as u64);
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_bytes(1, 42, b"test");

        buffer.push(&bytes[..HEADER_SIZE]);
        assert!(buffer.is_mid_frame());

        buffer.clear();
        assert!(!buffer.is_mid_frame());
        assert!(buffer.is_empty());
    }
}
