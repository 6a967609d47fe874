//! Client: pooled connections to one address behind a circuit breaker.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the pool,
//! timeouts, retries and the dial function. Every [`Client::call`]:
//! 1. Passes through the per-address circuit breaker
//! 2. Takes a connection from the pool (dialing if below `max_conn`)
//! 3. Stamps a fresh sequence number, sends the request and returns the
//!    connection to the pool so other calls can share it
//! 4. Waits for the reply, the call timeout, or cancellation
//! 5. Retries on transport failures up to `retry_limit` more times
//!
//! # Example
//!
//! ```ignore
//! use rawrpc::{ClientBuilder, Message};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = ClientBuilder::new("127.0.0.1:7000")
//!     .max_conn(8)
//!     .retry_limit(2)
//!     .build()
//!     .await?;
//!
//! let reply = client
//!     .call(&CancellationToken::new(), Message::request(1, "ping"))
//!     .await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::breaker::{breaker_for, CircuitBreaker};
use crate::config::{BreakerConfig, ClientConfig};
use crate::connection::Connection;
use crate::error::{PoolError, Result, RpcError};
use crate::pool::{Pool, PoolOptions};
use crate::protocol::{Message, PkgType, RESULT_OK};
use crate::transport::{default_connector, Connector};
use crate::BoxFuture;

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    addr: String,
    config: ClientConfig,
    connector: Option<Connector>,
    push_tx: Option<mpsc::Sender<Message>>,
}

impl ClientBuilder {
    /// Create a builder for the server at `addr` with default settings.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            config: ClientConfig::default(),
            connector: None,
            push_tx: None,
        }
    }

    /// Replace every setting at once.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Pool capacity. Default: 16
    pub fn max_conn(mut self, max_conn: usize) -> Self {
        self.config.max_conn = max_conn;
        self
    }

    /// Connections dialed by [`build`](Self::build). Default: 0
    pub fn idle_conn(mut self, idle_conn: usize) -> Self {
        self.config.idle_conn = idle_conn;
        self
    }

    /// How long a call waits for its reply. Default: 2 seconds
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// How long a dial may take. Default: 2 seconds
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    /// Extra attempts after a transport failure. Default: 2
    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.config.retry_limit = retry_limit;
        self
    }

    /// Heartbeat period and the timeout announced to the server.
    ///
    /// Default: every 1.5 seconds, 3 second timeout
    pub fn ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.connection = self.config.connection.with_ping(interval, timeout);
        self
    }

    /// Close connections idle this long. Default: 30 seconds
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.idle_timeout = timeout;
        self
    }

    /// Maximum connection lifetime. Default: 2 hours
    pub fn live_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.live_timeout = timeout;
        self
    }

    /// Breaker settings, used if this address has no breaker yet.
    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.config.breaker = breaker;
        self
    }

    /// Dial through `connector` instead of a plain TCP connect.
    pub fn connector<F, Fut>(mut self, connector: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TcpStream>> + Send + 'static,
    {
        self.connector = Some(Arc::new(move |addr: String| -> BoxFuture<'static, Result<TcpStream>> {
            Box::pin(connector(addr))
        }));
        self
    }

    /// Deliver server pushes to `tx`. Without it pushes are dropped.
    pub fn push_channel(mut self, tx: mpsc::Sender<Message>) -> Self {
        self.push_tx = Some(tx);
        self
    }

    /// Validate the settings, create the pool and dial `idle_conn` connections.
    pub async fn build(self) -> Result<Client> {
        self.config.validate()?;

        let connector = self
            .connector
            .unwrap_or_else(|| default_connector(self.config.dial_timeout));
        let addr = self.addr.clone();
        let conn_config = self.config.connection.clone();
        let push_tx = self.push_tx;

        let opts = PoolOptions::new(self.config.max_conn, self.config.idle_conn, move || {
            let connector = Arc::clone(&connector);
            let addr = addr.clone();
            let conn_config = conn_config.clone();
            let push_tx = push_tx.clone();
            async move {
                let stream = connector(addr.clone()).await?;
                Ok(Connection::start(stream, addr, conn_config, push_tx))
            }
        });
        let pool = Pool::new(opts).await?;
        let breaker = breaker_for(&self.addr, &self.config.breaker);

        debug!(addr = %self.addr, max_conn = self.config.max_conn, "Client ready");
        Ok(Client {
            addr: self.addr,
            config: self.config,
            pool,
            breaker,
        })
    }
}

/// RPC client for one remote address.
pub struct Client {
    addr: String,
    config: ClientConfig,
    pool: Pool<Arc<Connection>>,
    breaker: Arc<CircuitBreaker>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder(addr: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(addr)
    }

    /// Send `msg` and wait for its reply.
    ///
    /// Heartbeats and pushes are one-way and return `Ok(None)` once written.
    /// The message's sequence is overwritten per attempt.
    ///
    /// # Errors
    ///
    /// - [`RpcError::CircuitOpen`], [`RpcError::MaxConcurrency`],
    ///   [`RpcError::BreakerTimeout`] from the breaker
    /// - [`RpcError::ContextCanceled`] when `cancel` fires
    /// - [`RpcError::ReceiveTimeout`] when no reply arrives in time
    /// - [`RpcError::ReceiveChannelClosed`] when the connection dies mid-wait
    /// - [`RpcError::BodyTooLarge`] or [`RpcError::ExtTooLarge`] when the message
    ///   cannot be framed; the connection stays in the pool
    /// - [`RpcError::RetriesExhausted`] when every attempt failed to get a
    ///   connection or write the request
    pub async fn call(&self, cancel: &CancellationToken, msg: Message) -> Result<Option<Message>> {
        self.breaker.run(self.call_with_retry(cancel, msg)).await
    }

    /// Call with MsgPack-encoded request and reply bodies.
    ///
    /// A reply whose result code is not [`RESULT_OK`] becomes [`RpcError::Remote`].
    pub async fn call_msgpack<Req, Resp>(
        &self,
        cancel: &CancellationToken,
        command: u32,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let msg = Message::request(command, bytes::Bytes::new()).encode_body(request)?;
        let reply = self
            .call(cancel, msg)
            .await?
            .ok_or(RpcError::ReceiveChannelClosed)?;

        if reply.result != RESULT_OK {
            return Err(RpcError::Remote {
                command,
                result: reply.result,
            });
        }
        reply.decode_body()
    }

    async fn call_with_retry(&self, cancel: &CancellationToken, msg: Message) -> Result<Option<Message>> {
        let attempts = self.config.retry_limit + 1;
        let mut last = RpcError::ConnectionClosed;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(RpcError::ContextCanceled);
            }
            match self.attempt(cancel, msg.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() => {
                    debug!(addr = %self.addr, attempt, error = %e, "Attempt failed");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(RpcError::RetriesExhausted {
            attempts,
            source: Box::new(last),
        })
    }

    async fn attempt(&self, cancel: &CancellationToken, mut msg: Message) -> Result<Option<Message>> {
        let conn = match self.pool.get(cancel).await {
            Ok(conn) => conn,
            Err(RpcError::Pool(PoolError::Cancelled)) => return Err(RpcError::ContextCanceled),
            Err(e) => return Err(e),
        };

        let seq = conn.next_sequence();
        msg.sequence = seq;

        if msg.is_heartbeat() || msg.pkg_type == PkgType::Push {
            return match conn.send(msg, None).await {
                Ok(()) => {
                    self.pool.put(Some(conn));
                    Ok(None)
                }
                Err(e) => {
                    self.release(conn, &e);
                    Err(e)
                }
            };
        }

        let (tx, rx) = oneshot::channel();
        if let Err(e) = conn.send(msg, Some(tx)).await {
            self.release(conn, &e);
            return Err(e);
        }
        // Other calls may share the connection while this one waits.
        self.pool.put(Some(Arc::clone(&conn)));

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                conn.forget(seq);
                Err(RpcError::ContextCanceled)
            }
            reply = tokio::time::timeout(self.config.timeout, rx) => match reply {
                Ok(Ok(reply)) => Ok(Some(reply)),
                Ok(Err(_)) => Err(RpcError::ReceiveChannelClosed),
                Err(_) => {
                    conn.forget(seq);
                    Err(RpcError::ReceiveTimeout)
                }
            },
        };

        outcome
    }

    /// Hand a connection back after a failed send. Only transport failures
    /// close it; a message that could not be encoded never touched the socket.
    fn release(&self, conn: Arc<Connection>, err: &RpcError) {
        if err.is_retryable() {
            conn.close();
        } else {
            self.pool.put(Some(conn));
        }
    }

    /// Remote address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Effective settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The breaker shared by every client of this address.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Open connections, pooled or in use.
    pub fn live_connections(&self) -> usize {
        self.pool.live()
    }

    /// Connections waiting in the pool.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle()
    }

    /// Close the pool and its connections. Later calls fail.
    pub fn close(&self) {
        debug!(addr = %self.addr, "Client closing");
        self.pool.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("pool", &self.pool)
            .field("breaker", &self.breaker.state())
            .finish()
    }
}
