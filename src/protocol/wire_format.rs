//! Wire format encoding and decoding.
//!
//! Implements the 32-byte header format:
//! ```text
//! ┌──────────┬─────────┬─────────┬────────┬──────────┬─────────┬──────────┬─────────┐
//! │ MagicTag │ Command │ PkgType │ Result │ Sequence │ ReqId   │ BodySize │ ExtSize │
//! │ u32 LE   │ u32 LE  │ u16 LE  │ u32 LE │ u32 LE   │ i64 LE  │ u32 LE   │ u16 LE  │
//! └──────────┴─────────┴─────────┴────────┴──────────┴─────────┴──────────┴─────────┘
//! ```
//!
//! The header is followed by `ExtSize` extension bytes, then `BodySize` body bytes.
//! All multi-byte integers are Little Endian.

/// Header size in bytes (fixed, exactly 32).
pub const HEADER_SIZE: usize = 32;

/// Marker that starts every header. Used to resynchronize a corrupted stream.
pub const MAGIC_TAG: u32 = 0x5250_4354;

/// Default maximum body size (64 MB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Reserved command for heartbeat frames.
pub const HEARTBEAT_COMMAND: u32 = 0xFFFF_FFFF;

/// Heartbeat sub-frame type carried in the body of a heartbeat request.
pub const HEARTBEAT_TYPE: u16 = 1;

/// Size of the timeout field inside the heartbeat sub-frame.
pub const HEARTBEAT_TIMEOUT_SIZE: u16 = 4;

/// Encoded size of the heartbeat sub-frame.
pub const HEARTBEAT_FRAME_SIZE: usize = 8;

/// Successful result code.
pub const RESULT_OK: u32 = 0;

/// Result code for a request that could not be decoded.
pub const RESULT_BAD_REQUEST: u32 = 400;

/// Result code for a command nobody handles.
pub const RESULT_UNKNOWN_COMMAND: u32 = 404;

/// Role of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PkgType {
    /// Expects a reply correlated by sequence.
    Request,
    /// Answers a request.
    Reply,
    /// One-way message, no reply.
    Push,
    /// Value this version does not know; preserved as-is.
    Unknown(u16),
}

impl PkgType {
    /// Wire value.
    pub fn to_u16(self) -> u16 {
        match self {
            PkgType::Request => 1,
            PkgType::Reply => 2,
            PkgType::Push => 3,
            PkgType::Unknown(v) => v,
        }
    }

    /// Parse a wire value.
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => PkgType::Request,
            2 => PkgType::Reply,
            3 => PkgType::Push,
            other => PkgType::Unknown(other),
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Command identifier.
    pub command: u32,
    /// Frame role.
    pub pkg_type: PkgType,
    /// Status code.
    pub result: u32,
    /// Per-connection correlation number.
    pub sequence: u32,
    /// Caller-supplied correlation id.
    pub req_id: i64,
    /// Body length in bytes.
    pub body_size: u32,
    /// Extension length in bytes.
    pub ext_size: u16,
}

impl Header {
    /// Encode header to bytes (Little Endian), magic tag included.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (32 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&MAGIC_TAG.to_le_bytes());
        buf[4..8].copy_from_slice(&self.command.to_le_bytes());
        buf[8..10].copy_from_slice(&self.pkg_type.to_u16().to_le_bytes());
        buf[10..14].copy_from_slice(&self.result.to_le_bytes());
        buf[14..18].copy_from_slice(&self.sequence.to_le_bytes());
        buf[18..26].copy_from_slice(&self.req_id.to_le_bytes());
        buf[26..30].copy_from_slice(&self.body_size.to_le_bytes());
        buf[30..32].copy_from_slice(&self.ext_size.to_le_bytes());
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if the buffer is too short or does not start with [`MAGIC_TAG`].
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE || !starts_with_magic(buf) {
            return None;
        }
        Some(Self {
            command: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            pkg_type: PkgType::from_u16(u16::from_le_bytes([buf[8], buf[9]])),
            result: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
            sequence: u32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]),
            req_id: i64::from_le_bytes([
                buf[18], buf[19], buf[20], buf[21], buf[22], buf[23], buf[24], buf[25],
            ]),
            body_size: u32::from_le_bytes([buf[26], buf[27], buf[28], buf[29]]),
            ext_size: u16::from_le_bytes([buf[30], buf[31]]),
        })
    }

    /// Bytes that follow the header.
    #[inline]
    pub fn trailer_len(&self) -> usize {
        self.ext_size as usize + self.body_size as usize
    }

    /// Check if this is a heartbeat frame (request or reply).
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.command == HEARTBEAT_COMMAND
    }
}

/// Whether `buf` begins with the magic tag.
#[inline]
pub fn starts_with_magic(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf[0..4] == MAGIC_TAG.to_le_bytes()
}

/// Heartbeat payload: how long the sender will wait for the next pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Timeout in milliseconds.
    pub timeout_ms: u32,
}

impl Heartbeat {
    /// Encode the `Type | TimeoutSize | Timeout` sub-frame.
    pub fn encode(&self) -> [u8; HEARTBEAT_FRAME_SIZE] {
        let mut buf = [0u8; HEARTBEAT_FRAME_SIZE];
        buf[0..2].copy_from_slice(&HEARTBEAT_TYPE.to_le_bytes());
        buf[2..4].copy_from_slice(&HEARTBEAT_TIMEOUT_SIZE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.timeout_ms.to_le_bytes());
        buf
    }

    /// Parse the sub-frame. Returns `None` on a wrong type, size or length.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != HEARTBEAT_FRAME_SIZE {
            return None;
        }
        let kind = u16::from_le_bytes([buf[0], buf[1]]);
        let size = u16::from_le_bytes([buf[2], buf[3]]);
        if kind != HEARTBEAT_TYPE || size != HEARTBEAT_TIMEOUT_SIZE {
            return None;
        }
        Some(Self {
            timeout_ms: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}
