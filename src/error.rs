//! Error types for rawrpc.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all rawrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dial did not complete in time.
    #[error("dial {addr} timed out after {timeout:?}")]
    DialTimeout {
        /// Remote address.
        addr: String,
        /// Configured dial timeout.
        timeout: Duration,
    },

    /// Connection is closing or closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Body exceeds the configured maximum.
    #[error("body size {size} exceeds maximum {max}")]
    BodyTooLarge {
        /// Actual body size.
        size: usize,
        /// Maximum allowed body size.
        max: u32,
    },

    /// Extension exceeds what the u16 size field can carry.
    #[error("ext size {0} exceeds maximum {max}", max = u16::MAX)]
    ExtTooLarge(usize),

    /// Stream ended in the middle of a header.
    #[error("header too short: stream ended after {have} bytes")]
    HeaderTooShort {
        /// Bytes of the partial header that were buffered.
        have: usize,
    },

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Configuration could not be parsed or is inconsistent.
    #[error("invalid config: {0}")]
    Config(String),

    /// The caller's cancellation token fired.
    #[error("context canceled")]
    ContextCanceled,

    /// No reply arrived within the call timeout.
    #[error("receive timeout")]
    ReceiveTimeout,

    /// The reply channel was closed before a reply arrived.
    #[error("receive chan closed")]
    ReceiveChannelClosed,

    /// Every attempt failed.
    #[error("exhausted {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: Box<RpcError>,
    },

    /// The circuit breaker for the address is open.
    #[error("circuit open for {addr}")]
    CircuitOpen {
        /// Remote address guarded by the breaker.
        addr: String,
    },

    /// Too many concurrent calls through one breaker.
    #[error("max concurrency reached for {addr}")]
    MaxConcurrency {
        /// Remote address guarded by the breaker.
        addr: String,
    },

    /// The breaker's run timeout elapsed.
    #[error("circuit breaker timeout for {addr}")]
    BreakerTimeout {
        /// Remote address guarded by the breaker.
        addr: String,
    },

    /// The server answered with a non-zero result code.
    #[error("command {command} failed with result {result}")]
    Remote {
        /// Command that was called.
        command: u32,
        /// Result code from the reply header.
        result: u32,
    },

    /// Pool failure.
    #[error("pool: {0}")]
    Pool(#[from] PoolError),
}

impl RpcError {
    /// Whether the client should retry the attempt on another connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_)
                | RpcError::DialTimeout { .. }
                | RpcError::ConnectionClosed
                | RpcError::Pool(PoolError::Factory(_))
        )
    }

    /// Whether the error is one of the timeout kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RpcError::ReceiveTimeout | RpcError::DialTimeout { .. } | RpcError::BreakerTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Config(e.to_string())
    }
}

/// Errors returned by [`Pool`](crate::pool::Pool).
#[derive(Debug, Error)]
pub enum PoolError {
    /// Bad pool configuration.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The pool was torn down.
    #[error("pool closed")]
    Closed,

    /// The caller's cancellation token fired while waiting.
    #[error("get canceled")]
    Cancelled,

    /// The factory failed to create an item.
    #[error("factory: {0}")]
    Factory(#[source] Box<RpcError>),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
