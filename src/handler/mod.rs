//! Handler module - server-side request handling.
//!
//! Provides:
//! - [`Handler`] - the trait a [`Server`](crate::Server) dispatches to
//! - [`Router`] - maps command ids to handler functions
//! - [`Completion`] - lets a handler reply later, from any task
//!
//! # Example
//!
//! ```
//! use rawrpc::handler::Router;
//!
//! let mut router = Router::new();
//!
//! // Raw handler: echo the body back
//! router.register(1, |msg, done| async move { done.reply(msg.body).await });
//!
//! // Typed handler: body is MsgPack
//! router.register_msgpack(2, |words: Vec<String>, done| async move {
//!     done.reply_msgpack(&words.len()).await
//! });
//! ```

mod completion;
mod router;

pub(crate) use completion::{Completed, ReplySink};
pub use completion::Completion;
pub use router::{handler_fn, FnHandler, Handler, HandlerResult, Router, TypedHandler};
