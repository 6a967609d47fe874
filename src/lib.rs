//! # rawrpc
//!
//! Point-to-point RPC over raw TCP.
//!
//! Every frame carries a fixed 32-byte little-endian header starting with a
//! magic tag, followed by optional extension bytes and a body. Readers
//! resynchronize on the tag after corrupted input.
//!
//! ## Architecture
//!
//! - **Client**: a bounded pool of [`connection::Connection`]s to one
//!   address, guarded by a per-address [`breaker::CircuitBreaker`], with
//!   bounded retries on transport failures
//! - **Server**: one read task and one writer task per socket; handlers reply
//!   through a [`handler::Completion`], in any order, and replies are routed
//!   back to the socket the request came from
//! - **Liveness**: client connections send heartbeats announcing their
//!   timeout and close on missed heartbeats, idleness, or old age
//!
//! ## Example
//!
//! ```no_run
//! use rawrpc::{ClientBuilder, Message, Router, Server, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> rawrpc::Result<()> {
//!     let mut router = Router::new();
//!     router.register(1, |msg, done| async move { done.reply(msg.body).await });
//!
//!     let server = Server::bind("127.0.0.1:0", router, ServerConfig::default()).await?;
//!     let addr = server.local_addr().to_string();
//!     let shutdown = CancellationToken::new();
//!     tokio::spawn(server.serve(shutdown.clone()));
//!
//!     let client = ClientBuilder::new(addr).build().await?;
//!     let reply = client
//!         .call(&shutdown, Message::request(1, "hello"))
//!         .await?
//!         .expect("requests get replies");
//!     assert_eq!(&reply.body[..], b"hello");
//!
//!     shutdown.cancel();
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod breaker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod writer;

mod client;

pub use client::{Client, ClientBuilder};
pub use config::{BreakerConfig, ClientConfig, ConnectionConfig, ServerConfig};
pub use error::{PoolError, Result, RpcError};
pub use handler::{Completion, Handler, Router};
pub use protocol::{Message, PkgType};
pub use server::{ConnManager, Server};

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
