//! Outstanding-request registry.
//!
//! A request is registered when its frame is read and taken when its reply
//! is written. A completion whose key is no longer registered belongs to a
//! session that went away and is dropped.

use dashmap::DashSet;

/// Identity of one in-flight request on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    /// Session the request arrived on.
    pub conn_id: u64,
    /// Request command.
    pub command: u32,
    /// Caller-supplied correlation id.
    pub req_id: i64,
    /// Per-connection sequence number.
    pub sequence: u32,
}

/// Concurrent set of outstanding requests.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    outstanding: DashSet<RequestKey>,
}

impl RequestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key`. Returns `false` if an identical request is already
    /// outstanding.
    pub fn register(&self, key: RequestKey) -> bool {
        self.outstanding.insert(key)
    }

    /// Remove `key`. Returns `true` if it was outstanding.
    pub fn take(&self, key: &RequestKey) -> bool {
        self.outstanding.remove(key).is_some()
    }

    /// Whether `key` is outstanding.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.outstanding.contains(key)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    /// `true` if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}
