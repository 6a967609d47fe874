//! Deferred replies for server handlers.
//!
//! Every request a server reads is handed to its handler together with a
//! [`Completion`]. The handler replies through it whenever it is done, from
//! any task, in any order relative to other requests. The reply travels
//! through the server's completion channel and is written to the socket the
//! request came from.
//!
//! # Example
//!
//! ```ignore
//! async fn echo(msg: Message, done: Completion) -> Result<()> {
//!     done.reply(msg.body).await
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::codec::MsgPackCodec;
use crate::error::{Result, RpcError};
use crate::protocol::{Message, PkgType, RESULT_OK};
use crate::server::{ConnManager, RequestKey, RequestRegistry};

/// A finished request on its way back to the originating session.
#[derive(Debug)]
pub(crate) struct Completed {
    pub(crate) key: RequestKey,
    pub(crate) reply: Message,
}

/// Route from a session's requests back to the completion consumer.
///
/// Also holds what a request must release when it is never answered.
#[derive(Clone)]
pub(crate) struct ReplySink {
    tx: mpsc::Sender<Completed>,
    registry: Arc<RequestRegistry>,
    conns: Arc<ConnManager>,
}

impl ReplySink {
    pub(crate) fn new(
        tx: mpsc::Sender<Completed>,
        registry: Arc<RequestRegistry>,
        conns: Arc<ConnManager>,
    ) -> Self {
        Self { tx, registry, conns }
    }

    /// Forget `key` without replying. Returns `false` if it was already gone.
    fn abandon(&self, key: &RequestKey) -> bool {
        if !self.registry.take(key) {
            return false;
        }
        self.conns.untrack(key);
        true
    }
}

/// Handle used by a handler to answer one request.
///
/// Replying consumes the completion, so a request is answered at most once.
/// Dropping it unanswered releases the request. Completions created for
/// pushes discard whatever is sent through them.
pub struct Completion {
    key: RequestKey,
    sink: Option<ReplySink>,
}

impl Completion {
    pub(crate) fn new(key: RequestKey, sink: ReplySink) -> Self {
        Self {
            key,
            sink: Some(sink),
        }
    }

    /// Completion for a push; replies go nowhere.
    pub(crate) fn detached(key: RequestKey) -> Self {
        Self { key, sink: None }
    }

    /// Session the request arrived on.
    #[inline]
    pub fn conn_id(&self) -> u64 {
        self.key.conn_id
    }

    /// Command of the request being answered.
    #[inline]
    pub fn command(&self) -> u32 {
        self.key.command
    }

    /// Caller-supplied correlation id of the request.
    #[inline]
    pub fn req_id(&self) -> i64 {
        self.key.req_id
    }

    /// Sequence number of the request.
    #[inline]
    pub fn sequence(&self) -> u32 {
        self.key.sequence
    }

    /// `true` when the message being handled was a push.
    pub fn is_detached(&self) -> bool {
        self.sink.is_none()
    }

    /// Reply with result 0 and the given body.
    pub async fn reply(self, body: impl Into<Bytes>) -> Result<()> {
        self.reply_with(RESULT_OK, body).await
    }

    /// Reply with an explicit result code.
    pub async fn reply_with(self, result: u32, body: impl Into<Bytes>) -> Result<()> {
        let reply = Message {
            command: self.key.command,
            pkg_type: PkgType::Reply,
            result,
            sequence: self.key.sequence,
            req_id: self.key.req_id,
            ext: Bytes::new(),
            body: body.into(),
            heartbeat: None,
        };
        self.respond(reply).await
    }

    /// Reply with a MsgPack-encoded body.
    pub async fn reply_msgpack<T: Serialize>(self, value: &T) -> Result<()> {
        let body = MsgPackCodec::encode(value)?;
        self.reply(body).await
    }

    /// Send a fully built reply.
    ///
    /// The correlation fields (command, req_id, sequence) and the frame role
    /// are overwritten from the request, so only result, ext and body are
    /// taken from `reply`.
    pub async fn respond(mut self, mut reply: Message) -> Result<()> {
        let Some(sink) = self.sink.take() else {
            trace!(
                conn_id = self.key.conn_id,
                command = self.key.command,
                "Reply to push discarded"
            );
            return Ok(());
        };

        reply.command = self.key.command;
        reply.pkg_type = PkgType::Reply;
        reply.sequence = self.key.sequence;
        reply.req_id = self.key.req_id;
        reply.heartbeat = None;

        let sent = sink
            .tx
            .send(Completed {
                key: self.key,
                reply,
            })
            .await;
        if sent.is_err() {
            sink.abandon(&self.key);
            return Err(RpcError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        if sink.abandon(&self.key) {
            debug!(
                conn_id = self.key.conn_id,
                command = self.key.command,
                seq = self.key.sequence,
                "Request dropped without reply"
            );
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("key", &self.key)
            .field("detached", &self.is_detached())
            .finish()
    }
}
