//! Configuration for connections, breakers, clients and servers.
//!
//! Every struct deserializes from JSON with defaults for missing keys.
//! Durations are written in milliseconds under `*_ms` keys.
//!
//! ```
//! use rawrpc::config::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::from_json(r#"{ "max_conn": 4, "timeout_ms": 250 }"#).unwrap();
//! assert_eq!(config.max_conn, 4);
//! assert_eq!(config.timeout, Duration::from_millis(250));
//! assert_eq!(config.retry_limit, 2);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::protocol::DEFAULT_MAX_BODY_SIZE;
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

/// Default capacity of the server's completion channel.
pub const DEFAULT_COMPLETION_QUEUE: usize = 4096;

/// Per-connection liveness and framing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long the peer may stay silent before we give up on it. Announced
    /// in our heartbeats.
    #[serde(rename = "ping_timeout_ms", with = "millis")]
    pub ping_timeout: Duration,

    /// Close after this long without data frames and nothing in flight.
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection, checked when nothing is in flight.
    #[serde(rename = "live_timeout_ms", with = "millis")]
    pub live_timeout: Duration,

    /// Heartbeat period.
    #[serde(rename = "ping_interval_ms", with = "millis")]
    pub ping_interval: Duration,

    /// Idle deadline check period.
    #[serde(rename = "idle_check_interval_ms", with = "millis")]
    pub idle_check_interval: Duration,

    /// Live deadline check period.
    #[serde(rename = "live_check_interval_ms", with = "millis")]
    pub live_check_interval: Duration,

    /// Largest body accepted or sent.
    pub max_body_size: u32,

    /// Writer queue capacity.
    pub write_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(30),
            live_timeout: Duration::from_secs(2 * 60 * 60),
            ping_interval: Duration::from_millis(1500),
            idle_check_interval: Duration::from_secs(5),
            live_check_interval: Duration::from_secs(60),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            write_queue: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    /// Set the heartbeat period and the timeout announced to the peer.
    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    /// Check that every period is usable.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("ping_interval", self.ping_interval),
            ("idle_check_interval", self.idle_check_interval),
            ("live_check_interval", self.live_check_interval),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(RpcError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.write_queue == 0 {
            return Err(RpcError::Config("write_queue must be non-zero".into()));
        }
        Ok(())
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Upper bound on one guarded call.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,

    /// How long an open breaker rejects before letting a trial through.
    #[serde(rename = "sleep_window_ms", with = "millis")]
    pub sleep_window: Duration,

    /// Concurrent calls allowed through the breaker.
    pub max_concurrent_requests: usize,

    /// Requests in the rolling window before the error rate is considered.
    pub request_volume_threshold: u64,

    /// Failure percentage that trips the breaker.
    pub error_percent_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            sleep_window: Duration::from_millis(500),
            max_concurrent_requests: 5000,
            request_volume_threshold: 100,
            error_percent_threshold: 50,
        }
    }
}

impl BreakerConfig {
    /// Reject settings that would make the breaker unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(RpcError::Config(
                "max_concurrent_requests must be non-zero".into(),
            ));
        }
        if self.error_percent_threshold > 100 {
            return Err(RpcError::Config(format!(
                "error_percent_threshold {} exceeds 100",
                self.error_percent_threshold
            )));
        }
        Ok(())
    }
}

/// Client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Pool capacity.
    pub max_conn: usize,

    /// Connections opened eagerly.
    pub idle_conn: usize,

    /// How long a call waits for its reply.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,

    /// How long a dial may take.
    #[serde(rename = "dial_timeout_ms", with = "millis")]
    pub dial_timeout: Duration,

    /// Extra attempts after the first one fails.
    pub retry_limit: u32,

    /// Settings for each pooled connection.
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Breaker guarding the remote address.
    pub breaker: BreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_conn: 16,
            idle_conn: 0,
            timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(2),
            retry_limit: 2,
            connection: ConnectionConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent pool sizes and unusable sub-configs.
    pub fn validate(&self) -> Result<()> {
        if self.max_conn == 0 {
            return Err(RpcError::Config("max_conn must be non-zero".into()));
        }
        if self.idle_conn > self.max_conn {
            return Err(RpcError::Config(format!(
                "idle_conn {} exceeds max_conn {}",
                self.idle_conn, self.max_conn
            )));
        }
        self.connection.validate()?;
        self.breaker.validate()
    }
}

/// Server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Largest body accepted or sent.
    pub max_body_size: u32,

    /// Per-session writer queue capacity.
    pub write_queue: usize,

    /// Capacity of the shared completion channel.
    pub completion_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            write_queue: DEFAULT_CHANNEL_CAPACITY,
            completion_queue: DEFAULT_COMPLETION_QUEUE,
        }
    }
}

impl ServerConfig {
    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Queues must hold at least one item.
    pub fn validate(&self) -> Result<()> {
        if self.write_queue == 0 || self.completion_queue == 0 {
            return Err(RpcError::Config("queue capacities must be non-zero".into()));
        }
        Ok(())
    }
}

/// `Duration` as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
