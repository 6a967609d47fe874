//! MsgPack codec for typed message bodies, using `rmp-serde`.
//!
//! Structs are always written with `to_vec_named` so that the peer sees a map
//! keyed by field name. Positional arrays break as soon as either side adds or
//! reorders a field.
//!
//! # Example
//!
//! ```
//! use rawrpc::codec::MsgPackCodec;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Lookup {
//!     key: String,
//!     limit: u32,
//! }
//!
//! let query = Lookup { key: "user:7".to_string(), limit: 10 };
//! let encoded = MsgPackCodec::encode(&query).unwrap();
//! let decoded: Lookup = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, query);
//! ```

use crate::error::Result;

/// MessagePack codec for structured bodies.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MsgPackEncode`](crate::RpcError::MsgPackEncode) if
    /// the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MsgPackDecode`](crate::RpcError::MsgPackDecode) if
    /// the bytes do not describe a `T`.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
