//! Command routing for server handlers.
//!
//! A [`Router`] maps command ids to handler functions. Commands without a
//! route are answered with result 404; typed routes whose body does not
//! decode are answered with result 400.
//!
//! # Example
//!
//! ```
//! use rawrpc::handler::Router;
//!
//! let mut router = Router::new();
//! router.register(1, |msg, done| async move { done.reply(msg.body).await });
//! router.register_msgpack(2, |n: u64, done| async move { done.reply_msgpack(&(n * 2)).await });
//!
//! assert!(router.has_route(1));
//! assert_eq!(router.len(), 2);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::Completion;
use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::protocol::{Message, RESULT_BAD_REQUEST, RESULT_UNKNOWN_COMMAND};
use crate::BoxFuture;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Anything that can serve messages read by a [`Server`](crate::Server).
///
/// `handle` is called once per request or push, from the session's read
/// task. The returned future is spawned, so handlers run concurrently and may
/// reply in any order.
pub trait Handler: Send + Sync + 'static {
    /// Handle one message. Requests are answered through `completion`.
    fn handle(&self, msg: Message, completion: Completion) -> BoxFuture<'static, ()>;
}

/// Handler built from a closure, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure as a [`Handler`].
///
/// Errors returned by the closure are logged.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message, Completion) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Message, Completion) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, msg: Message, completion: Completion) -> BoxFuture<'static, ()> {
        let command = msg.command;
        let fut = (self.f)(msg, completion);
        Box::pin(async move {
            if let Err(e) = fut.await {
                warn!(command, error = %e, "Handler failed");
            }
        })
    }
}

/// A single routed command.
trait Route: Send + Sync + 'static {
    fn call(&self, msg: Message, completion: Completion) -> BoxFuture<'static, HandlerResult>;
}

struct RawRoute<F> {
    handler: F,
}

impl<F, Fut> Route for RawRoute<F>
where
    F: Fn(Message, Completion) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, msg: Message, completion: Completion) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(msg, completion))
    }
}

/// Wrapper that decodes the MsgPack body before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, Completion) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, Completion) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Route for TypedHandler<F, T, Fut>
where
    F: Fn(T, Completion) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, msg: Message, completion: Completion) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match MsgPackCodec::decode(&msg.body) {
            Ok(v) => v,
            Err(e) => {
                warn!(command = msg.command, error = %e, "Undecodable request body");
                return Box::pin(completion.reply_with(RESULT_BAD_REQUEST, Bytes::new()));
            }
        };

        Box::pin((self.handler)(parsed, completion))
    }
}

/// Routes messages to handlers by command id.
#[derive(Default)]
pub struct Router {
    routes: HashMap<u32, Box<dyn Route>>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `command` to a handler that receives the raw message.
    ///
    /// Registering the same command twice replaces the earlier handler.
    pub fn register<F, Fut>(&mut self, command: u32, handler: F)
    where
        F: Fn(Message, Completion) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.routes.insert(command, Box::new(RawRoute { handler }));
    }

    /// Route `command` to a handler that receives the MsgPack-decoded body.
    pub fn register_msgpack<F, T, Fut>(&mut self, command: u32, handler: F)
    where
        F: Fn(T, Completion) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.routes
            .insert(command, Box::new(TypedHandler::new(handler)));
    }

    /// Whether `command` has a handler.
    pub fn has_route(&self, command: u32) -> bool {
        self.routes.contains_key(&command)
    }

    /// Number of routed commands.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// `true` if nothing is routed.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Handler for Router {
    fn handle(&self, msg: Message, completion: Completion) -> BoxFuture<'static, ()> {
        let command = msg.command;
        match self.routes.get(&command) {
            Some(route) => {
                let fut = route.call(msg, completion);
                Box::pin(async move {
                    if let Err(e) = fut.await {
                        warn!(command, error = %e, "Handler failed");
                    }
                })
            }
            None => Box::pin(async move {
                warn!(command, "No route for command");
                if let Err(e) = completion
                    .reply_with(RESULT_UNKNOWN_COMMAND, Bytes::new())
                    .await
                {
                    warn!(command, error = %e, "Failed to reject unknown command");
                }
            }),
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut commands: Vec<_> = self.routes.keys().copied().collect();
        commands.sort_unstable();
        f.debug_struct("Router").field("commands", &commands).finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use std::sync::Arc;

    use super::*;
    use crate::handler::completion::{Completed, ReplySink};
    use crate::protocol::{DEFAULT_MAX_BODY_SIZE, RESULT_OK};
    use crate::server::{ConnManager, RequestKey, RequestRegistry};

    fn completion_for(msg: &Message) -> (Completion, mpsc::Receiver<Completed>) {
        let (tx, rx) = mpsc::channel(4);
        let key = RequestKey {
            conn_id: 1,
            command: msg.command,
            req_id: msg.req_id,
            sequence: msg.sequence,
        };
        let sink = ReplySink::new(
            tx,
            Arc::new(RequestRegistry::new()),
            Arc::new(ConnManager::new(DEFAULT_MAX_BODY_SIZE)),
        );
        (Completion::new(key, sink), rx)
    }

    #[test]
    fn test_register_routes() {
        let mut router = Router::new();
        assert!(router.is_empty());

        router.register(1, |_msg, _done| async { Ok(()) });
        router.register_msgpack(2, |_: String, _done| async { Ok(()) });

        assert!(router.has_route(1));
        assert!(router.has_route(2));
        assert!(!router.has_route(3));
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn test_register_replaces_route() {
        let mut router = Router::new();
        router.register(1, |_msg, _done| async { Ok(()) });
        router.register(1, |_msg, _done| async { Ok(()) });
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_raw_route() {
        let mut router = Router::new();
        router.register(5, |msg, done| async move { done.reply(msg.body).await });

        let msg = Message::request(5, "ping").with_req_id(8).with_sequence(2);
        let (done, mut rx) = completion_for(&msg);
        router.handle(msg, done).await;

        let reply = rx.recv().await.unwrap().reply;
        assert_eq!(reply.result, RESULT_OK);
        assert_eq!(reply.body, Bytes::from_static(b"ping"));
        assert_eq!(reply.req_id, 8);
    }

    #[tokio::test]
    async fn test_dispatch_typed_route() {
        let mut router = Router::new();
        router.register_msgpack(6, |n: u64, done| async move {
            done.reply_msgpack(&(n + 1)).await
        });

        let msg = Message::request(6, "").encode_body(&41u64).unwrap();
        let (done, mut rx) = completion_for(&msg);
        router.handle(msg, done).await;

        let reply = rx.recv().await.unwrap().reply;
        assert_eq!(reply.decode_body::<u64>().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_unknown_command_is_404() {
        let router = Router::new();
        let msg = Message::request(99, "x").with_sequence(1);
        let (done, mut rx) = completion_for(&msg);
        router.handle(msg, done).await;

        let reply = rx.recv().await.unwrap().reply;
        assert_eq!(reply.result, RESULT_UNKNOWN_COMMAND);
        assert_eq!(reply.command, 99);
        assert!(reply.body.is_empty());
    }

    #[tokio::test]
    async fn test_bad_body_is_400() {
        let mut router = Router::new();
        router.register_msgpack(7, |_: Vec<String>, done| async move { done.reply("").await });

        // 0xc1 is never valid MsgPack.
        let msg = Message::request(7, Bytes::from_static(&[0xc1]));
        let (done, mut rx) = completion_for(&msg);
        router.handle(msg, done).await;

        let reply = rx.recv().await.unwrap().reply;
        assert_eq!(reply.result, RESULT_BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|msg: Message, done: Completion| async move {
            done.reply_with(msg.command + 1, "").await
        });

        let msg = Message::request(10, "");
        let (done, mut rx) = completion_for(&msg);
        handler.handle(msg, done).await;

        assert_eq!(rx.recv().await.unwrap().reply.result, 11);
    }
}
