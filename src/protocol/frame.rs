//! Message envelope and frame encoding.
//!
//! A [`Message`] is the logical view of one frame. Ext and body use
//! `bytes::Bytes`, so cloning a message never copies payload.
//!
//! # Example
//!
//! ```
//! use rawrpc::protocol::{encode_message, FrameBuffer, Message, DEFAULT_MAX_BODY_SIZE};
//!
//! let msg = Message::request(7, "hello").with_req_id(42).with_sequence(1);
//! let bytes = encode_message(&msg, DEFAULT_MAX_BODY_SIZE).unwrap();
//!
//! let mut buffer = FrameBuffer::new();
//! assert_eq!(buffer.push(&bytes), vec![msg]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::wire_format::{Header, Heartbeat, PkgType, HEADER_SIZE, HEARTBEAT_COMMAND, RESULT_OK};
use crate::codec::MsgPackCodec;
use crate::error::{Result, RpcError};

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Command identifier.
    pub command: u32,
    /// Frame role.
    pub pkg_type: PkgType,
    /// Status code (0 = ok).
    pub result: u32,
    /// Per-connection correlation number.
    pub sequence: u32,
    /// Caller-supplied correlation id, opaque to the transport.
    pub req_id: i64,
    /// Extension bytes.
    pub ext: Bytes,
    /// Body bytes.
    pub body: Bytes,
    /// Parsed heartbeat sub-frame (heartbeat requests only).
    pub heartbeat: Option<Heartbeat>,
}

impl Message {
    fn new(command: u32, pkg_type: PkgType, body: Bytes) -> Self {
        Self {
            command,
            pkg_type,
            result: RESULT_OK,
            sequence: 0,
            req_id: 0,
            ext: Bytes::new(),
            body,
            heartbeat: None,
        }
    }

    /// Create a request.
    pub fn request(command: u32, body: impl Into<Bytes>) -> Self {
        Self::new(command, PkgType::Request, body.into())
    }

    /// Create a one-way push.
    pub fn push(command: u32, body: impl Into<Bytes>) -> Self {
        Self::new(command, PkgType::Push, body.into())
    }

    /// Create a heartbeat request announcing the sender's ping timeout.
    pub fn heartbeat_request(timeout_ms: u32) -> Self {
        let mut msg = Self::new(HEARTBEAT_COMMAND, PkgType::Request, Bytes::new());
        msg.heartbeat = Some(Heartbeat { timeout_ms });
        msg
    }

    /// Create a reply correlated with `request` (same command, req_id and sequence).
    pub fn reply_to(request: &Message, result: u32, body: impl Into<Bytes>) -> Self {
        Self {
            command: request.command,
            pkg_type: PkgType::Reply,
            result,
            sequence: request.sequence,
            req_id: request.req_id,
            ext: Bytes::new(),
            body: body.into(),
            heartbeat: None,
        }
    }

    /// Set the request id.
    pub fn with_req_id(mut self, req_id: i64) -> Self {
        self.req_id = req_id;
        self
    }

    /// Set the sequence number.
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Set the result code.
    pub fn with_result(mut self, result: u32) -> Self {
        self.result = result;
        self
    }

    /// Set the extension bytes.
    pub fn with_ext(mut self, ext: impl Into<Bytes>) -> Self {
        self.ext = ext.into();
        self
    }

    /// Replace the body with the MsgPack encoding of `value`.
    pub fn encode_body<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.body = Bytes::from(MsgPackCodec::encode(value)?);
        Ok(self)
    }

    /// Decode the body as MsgPack.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.body)
    }

    /// Check if this is a heartbeat (request or reply).
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.command == HEARTBEAT_COMMAND
    }

    /// Check if this is a heartbeat request (ping).
    #[inline]
    pub fn is_heartbeat_request(&self) -> bool {
        self.is_heartbeat() && self.pkg_type == PkgType::Request
    }

    /// Check if this is a heartbeat reply (pong).
    #[inline]
    pub fn is_heartbeat_reply(&self) -> bool {
        self.is_heartbeat() && self.pkg_type == PkgType::Reply
    }

    /// Build a message from a decoded header and its trailing bytes.
    ///
    /// Heartbeat request bodies are parsed into [`Heartbeat`] and consumed.
    pub(crate) fn from_parts(header: Header, ext: Bytes, body: Bytes) -> Self {
        let mut msg = Self {
            command: header.command,
            pkg_type: header.pkg_type,
            result: header.result,
            sequence: header.sequence,
            req_id: header.req_id,
            ext,
            body,
            heartbeat: None,
        };

        if msg.is_heartbeat_request() {
            if let Some(hb) = Heartbeat::decode(&msg.body) {
                msg.heartbeat = Some(hb);
                msg.body = Bytes::new();
            }
        }

        msg
    }
}

/// Encode a message into a single contiguous frame.
///
/// Heartbeat requests carrying a [`Heartbeat`] have the sub-frame serialized
/// into the body.
pub fn encode_message(msg: &Message, max_body_size: u32) -> Result<Bytes> {
    let heartbeat = match msg.heartbeat {
        Some(hb) if msg.is_heartbeat_request() => Some(hb.encode()),
        _ => None,
    };
    let body: &[u8] = match &heartbeat {
        Some(sub) => sub,
        None => &msg.body,
    };

    if body.len() > max_body_size as usize {
        return Err(RpcError::BodyTooLarge {
            size: body.len(),
            max: max_body_size,
        });
    }
    let ext_size = u16::try_from(msg.ext.len()).map_err(|_| RpcError::ExtTooLarge(msg.ext.len()))?;

    let header = Header {
        command: msg.command,
        pkg_type: msg.pkg_type,
        result: msg.result,
        sequence: msg.sequence,
        req_id: msg.req_id,
        body_size: body.len() as u32,
        ext_size,
    };

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + msg.ext.len() + body.len());
    buf.put_slice(&header.encode());
    buf.put_slice(&msg.ext);
    buf.put_slice(body);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_format::DEFAULT_MAX_BODY_SIZE;

    #[test]
    fn test_request_defaults() {
        let msg = Message::request(5, "abc");
        assert_eq!(msg.pkg_type, PkgType::Request);
        assert_eq!(msg.result, RESULT_OK);
        assert_eq!(msg.sequence, 0);
        assert_eq!(&msg.body[..], b"abc");
        assert!(!msg.is_heartbeat());
    }

    #[test]
    fn test_reply_to_copies_correlation() {
        let req = Message::request(9, "q").with_req_id(77).with_sequence(3);
        let reply = Message::reply_to(&req, 1, "a");

        assert_eq!(reply.command, 9);
        assert_eq!(reply.pkg_type, PkgType::Reply);
        assert_eq!(reply.req_id, 77);
        assert_eq!(reply.sequence, 3);
        assert_eq!(reply.result, 1);
    }

    #[test]
    fn test_encode_layout() {
        let msg = Message::push(1, "body").with_ext("xy");
        let bytes = encode_message(&msg, DEFAULT_MAX_BODY_SIZE).unwrap();

        assert_eq!(bytes.len(), HEADER_SIZE + 2 + 4);
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.ext_size, 2);
        assert_eq!(header.body_size, 4);
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 2], b"xy");
        assert_eq!(&bytes[HEADER_SIZE + 2..], b"body");
    }

    #[test]
    fn test_heartbeat_request_serializes_subframe() {
        let msg = Message::heartbeat_request(3000).with_sequence(4);
        let bytes = encode_message(&msg, DEFAULT_MAX_BODY_SIZE).unwrap();

        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.body_size, 8);
        assert_eq!(&bytes[HEADER_SIZE..], &Heartbeat { timeout_ms: 3000 }.encode());

        let decoded = Message::from_parts(header, Bytes::new(), bytes.slice(HEADER_SIZE..));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_heartbeat_reply_body_not_parsed() {
        let req = Message::heartbeat_request(10);
        let reply = Message::reply_to(&req, RESULT_OK, Heartbeat { timeout_ms: 1 }.encode().to_vec());
        let header = Header::decode(&encode_message(&reply, DEFAULT_MAX_BODY_SIZE).unwrap()).unwrap();

        let decoded = Message::from_parts(header, Bytes::new(), reply.body.clone());
        assert!(decoded.is_heartbeat_reply());
        assert!(decoded.heartbeat.is_none());
        assert_eq!(decoded.body.len(), 8);
    }

    #[test]
    fn test_malformed_heartbeat_body_kept() {
        let mut msg = Message::request(HEARTBEAT_COMMAND, "junk");
        msg.sequence = 1;
        let bytes = encode_message(&msg, DEFAULT_MAX_BODY_SIZE).unwrap();
        let header = Header::decode(&bytes).unwrap();

        let decoded = Message::from_parts(header, Bytes::new(), bytes.slice(HEADER_SIZE..));
        assert!(decoded.heartbeat.is_none());
        assert_eq!(&decoded.body[..], b"junk");
    }

    #[test]
    fn test_body_too_large() {
        let msg = Message::request(1, vec![0u8; 101]);
        let err = encode_message(&msg, 100).unwrap_err();
        assert!(matches!(err, RpcError::BodyTooLarge { size: 101, max: 100 }));
    }

    #[test]
    fn test_ext_too_large() {
        let msg = Message::request(1, "").with_ext(vec![0u8; u16::MAX as usize + 1]);
        let err = encode_message(&msg, DEFAULT_MAX_BODY_SIZE).unwrap_err();
        assert!(matches!(err, RpcError::ExtTooLarge(_)));
    }

    #[test]
    fn test_msgpack_body() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Ping {
            n: u32,
        }

        let msg = Message::request(2, Bytes::new()).encode_body(&Ping { n: 9 }).unwrap();
        let back: Ping = msg.decode_body().unwrap();
        assert_eq!(back, Ping { n: 9 });
    }
}
