//! Codec module - serialization of typed message bodies.
//!
//! The transport itself only moves bytes; [`MsgPackCodec`] is what
//! [`Message::encode_body`](crate::Message::encode_body), the typed router
//! handlers and [`Completion::reply_msgpack`](crate::handler::Completion::reply_msgpack)
//! use when the body carries a structured value.
//!
//! Codecs are marker structs with static methods rather than trait objects.

mod msgpack;

pub use msgpack::MsgPackCodec;
