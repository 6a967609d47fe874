//! Protocol module - wire format, framing, and message decoding.
//!
//! This module implements the binary protocol:
//! - 32-byte little-endian header encoding/decoding
//! - Message envelope with heartbeat sub-frame
//! - Frame buffer for accumulating partial reads, with resync on corrupted input
//! - Async reader looping over short reads

mod frame;
mod frame_buffer;
mod reader;
mod wire_format;

pub use frame::{encode_message, Message};
pub use frame_buffer::FrameBuffer;
pub use reader::MessageReader;
pub use wire_format::{
    starts_with_magic, Header, Heartbeat, PkgType, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE,
    HEARTBEAT_COMMAND, HEARTBEAT_FRAME_SIZE, MAGIC_TAG, RESULT_BAD_REQUEST, RESULT_OK,
    RESULT_UNKNOWN_COMMAND,
};
