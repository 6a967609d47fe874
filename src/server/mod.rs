//! TCP server with out-of-order replies.
//!
//! Each accepted socket becomes a session with its own read task and writer
//! task. Requests are registered, then handed to the [`Handler`] on a fresh
//! task together with a [`Completion`]. Finished replies flow through one
//! bounded completion channel to a single consumer, which checks the
//! registry and writes each reply to the socket its request came from.
//!
//! ```text
//!  socket ─► read task ─┬─ heartbeat ─► pong (try_enqueue)
//!                       ├─ Request ─► registry + spawn handler
//!                       └─ Push ─► spawn handler (no reply)
//!
//!  handler ─► Completion ─► completion channel ─► consumer ─► session writer (try_enqueue)
//! ```
//!
//! The server never closes a session for missing heartbeats; it only answers
//! them. Sessions end when the peer closes the socket, a read or write fails,
//! the server shuts down, or a reply finds the session's write queue full.

mod conn_manager;
mod registry;

pub use conn_manager::ConnManager;
pub use registry::{RequestKey, RequestRegistry};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::connection::next_conn_id;
use crate::error::{Result, RpcError};
use crate::handler::{Completed, Completion, Handler, ReplySink};
use crate::protocol::{encode_message, Message, MessageReader, PkgType, RESULT_OK};
use crate::transport::{bind, configure};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct Shared {
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    conns: Arc<ConnManager>,
    registry: Arc<RequestRegistry>,
}

/// A bound, not yet serving, RPC server.
///
/// # Example
///
/// ```ignore
/// let mut router = Router::new();
/// router.register(1, |msg, done| async move { done.reply(msg.body).await });
///
/// let server = Server::bind("127.0.0.1:0", router, ServerConfig::default()).await?;
/// let shutdown = CancellationToken::new();
/// tokio::spawn(server.serve(shutdown.clone()));
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Server {
    /// Validate `config` and bind a listener on `addr`.
    pub async fn bind<H: Handler>(addr: &str, handler: H, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = bind(addr).await?;
        Self::from_listener(listener, handler, config)
    }

    /// Serve on an already bound listener.
    pub fn from_listener<H: Handler>(
        listener: TcpListener,
        handler: H,
        config: ServerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let local_addr = listener.local_addr()?;
        let conns = Arc::new(ConnManager::new(config.max_body_size));
        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                handler: Arc::new(handler),
                config,
                conns,
                registry: Arc::new(RequestRegistry::new()),
            }),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session registry, for pushing to connected peers.
    pub fn connections(&self) -> Arc<ConnManager> {
        Arc::clone(&self.shared.conns)
    }

    /// Outstanding-request registry.
    pub fn requests(&self) -> Arc<RequestRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Accept and serve connections until `shutdown` is cancelled.
    ///
    /// On shutdown every session is cancelled and the completion consumer
    /// stops; replies still in flight are dropped.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel(self.shared.config.completion_queue);
        let consumer = tokio::spawn(drain_completions(
            Arc::clone(&self.shared),
            done_rx,
            shutdown.clone(),
        ));
        info!(addr = %self.local_addr, "Server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            if let Err(e) = configure(&stream) {
                warn!(%peer, error = %e, "Socket setup failed");
            }
            tokio::spawn(run_session(
                Arc::clone(&self.shared),
                stream,
                peer,
                done_tx.clone(),
                shutdown.child_token(),
            ));
        }

        self.shared.conns.close_all();
        drop(done_tx);
        let _ = consumer.await;
        info!(addr = %self.local_addr, "Server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.shared.conns.len())
            .field("outstanding", &self.shared.registry.len())
            .finish()
    }
}

async fn run_session(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    done_tx: mpsc::Sender<Completed>,
    cancel: CancellationToken,
) {
    let conn_id = next_conn_id();
    let (read_half, write_half) = stream.into_split();
    let (writer, writer_task) =
        spawn_writer_task(write_half, shared.config.write_queue, cancel.clone());
    shared
        .conns
        .on_connect(conn_id, peer, writer.clone(), cancel.clone());

    let watch = cancel.clone();
    tokio::spawn(async move {
        if let Ok(Err(e)) = writer_task.await {
            debug!(conn_id, error = %e, "Writer stopped");
            watch.cancel();
        }
    });

    let sink = ReplySink::new(
        done_tx,
        Arc::clone(&shared.registry),
        Arc::clone(&shared.conns),
    );
    let mut reader = MessageReader::new(read_half, shared.config.max_body_size);
    loop {
        match reader.read_message(&cancel).await {
            Ok(msg) => shared.dispatch(conn_id, &writer, msg, &sink),
            Err(RpcError::ContextCanceled) => break,
            Err(RpcError::ConnectionClosed) => {
                debug!(conn_id, %peer, "Peer closed connection");
                break;
            }
            Err(e) => {
                warn!(conn_id, %peer, error = %e, "Read failed");
                break;
            }
        }
    }

    let abandoned = shared.conns.on_disconnect(conn_id, &shared.registry);
    if abandoned > 0 {
        debug!(conn_id, abandoned, "Session closed with requests in flight");
    }
}

impl Shared {
    fn dispatch(
        &self,
        conn_id: u64,
        writer: &WriterHandle,
        msg: Message,
        sink: &ReplySink,
    ) {
        if msg.is_heartbeat_request() {
            let pong = Message::reply_to(&msg, RESULT_OK, Bytes::new());
            let sent = encode_message(&pong, self.config.max_body_size)
                .and_then(|bytes| writer.try_enqueue(bytes));
            match sent {
                Ok(()) => trace!(conn_id, seq = msg.sequence, "Heartbeat answered"),
                Err(e) => debug!(conn_id, error = %e, "Heartbeat reply not queued"),
            }
            return;
        }
        if msg.is_heartbeat_reply() {
            trace!(conn_id, seq = msg.sequence, "Heartbeat reply ignored");
            return;
        }

        let key = RequestKey {
            conn_id,
            command: msg.command,
            req_id: msg.req_id,
            sequence: msg.sequence,
        };

        match msg.pkg_type {
            PkgType::Request => {
                if !self.registry.register(key) {
                    warn!(conn_id, seq = msg.sequence, command = msg.command, "Duplicate request ignored");
                    return;
                }
                if !self.conns.track(key) {
                    self.registry.take(&key);
                    return;
                }
                let completion = Completion::new(key, sink.clone());
                tokio::spawn(self.handler.handle(msg, completion));
            }
            PkgType::Push => {
                tokio::spawn(self.handler.handle(msg, Completion::detached(key)));
            }
            PkgType::Reply | PkgType::Unknown(_) => warn!(
                conn_id,
                command = msg.command,
                pkg_type = msg.pkg_type.to_u16(),
                "Unexpected frame on server session"
            ),
        }
    }

    fn complete(&self, done: Completed) {
        let Completed { key, reply } = done;
        if !self.registry.take(&key) {
            debug!(
                conn_id = key.conn_id,
                seq = key.sequence,
                command = key.command,
                "Reply for departed request dropped"
            );
            return;
        }
        self.conns.untrack(&key);

        let Some(writer) = self.conns.writer(key.conn_id) else {
            debug!(conn_id = key.conn_id, seq = key.sequence, "Session gone, reply dropped");
            return;
        };
        let bytes = match encode_message(&reply, self.conns.max_body_size()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(conn_id = key.conn_id, seq = key.sequence, error = %e, "Reply encode failed");
                return;
            }
        };
        // Never wait on one socket here. A full queue means the peer stopped
        // reading, so that session is closed.
        if let Err(e) = writer.try_enqueue(bytes) {
            if writer.is_closed() {
                debug!(conn_id = key.conn_id, error = %e, "Reply not sent");
            } else {
                warn!(conn_id = key.conn_id, seq = key.sequence, "Write queue full, closing session");
                self.conns.close_session(key.conn_id);
            }
        }
    }
}

async fn drain_completions(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Completed>,
    shutdown: CancellationToken,
) {
    loop {
        let done = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = rx.recv() => match item {
                Some(done) => done,
                None => break,
            },
        };
        shared.complete(done);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::handler::{handler_fn, Router};
    use crate::protocol::{RESULT_UNKNOWN_COMMAND, DEFAULT_MAX_BODY_SIZE};

    async fn start(router: Router) -> (SocketAddr, Arc<ConnManager>, CancellationToken) {
        let server = Server::bind("127.0.0.1:0", router, ServerConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr();
        let conns = server.connections();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));
        (addr, conns, shutdown)
    }

    async fn raw_client(
        addr: SocketAddr,
    ) -> (MessageReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        (MessageReader::new(r, DEFAULT_MAX_BODY_SIZE), w)
    }

    async fn write(w: &mut tokio::net::tcp::OwnedWriteHalf, msg: &Message) {
        let bytes = encode_message(msg, DEFAULT_MAX_BODY_SIZE).unwrap();
        w.write_all(&bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_config() {
        let config = ServerConfig {
            completion_queue: 0,
            ..Default::default()
        };
        let err = Server::bind("127.0.0.1:0", Router::new(), config)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
    }

    #[tokio::test]
    async fn test_echo_and_heartbeat() {
        let mut router = Router::new();
        router.register(1, |msg, done| async move { done.reply(msg.body).await });
        let (addr, _conns, shutdown) = start(router).await;

        let (mut reader, mut w) = raw_client(addr).await;
        let cancel = CancellationToken::new();

        write(&mut w, &Message::heartbeat_request(3000).with_sequence(1)).await;
        let pong = reader.read_message(&cancel).await.unwrap();
        assert!(pong.is_heartbeat_reply());
        assert_eq!(pong.sequence, 1);

        write(&mut w, &Message::request(1, "hi").with_req_id(5).with_sequence(2)).await;
        let reply = reader.read_message(&cancel).await.unwrap();
        assert_eq!(reply.pkg_type, PkgType::Reply);
        assert_eq!(reply.req_id, 5);
        assert_eq!(reply.sequence, 2);
        assert_eq!(&reply.body[..], b"hi");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_command_replies_404() {
        let (addr, _conns, shutdown) = start(Router::new()).await;
        let (mut reader, mut w) = raw_client(addr).await;

        write(&mut w, &Message::request(42, "").with_sequence(1)).await;
        let reply = reader.read_message(&CancellationToken::new()).await.unwrap();
        assert_eq!(reply.result, RESULT_UNKNOWN_COMMAND);
        assert_eq!(reply.command, 42);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_replies_follow_completion_order() {
        let mut router = Router::new();
        router.register(1, |msg, done| async move {
            let delay = u64::from(msg.body[0]);
            tokio::time::sleep(Duration::from_millis(delay * 40)).await;
            done.reply(msg.body).await
        });
        let (addr, _conns, shutdown) = start(router).await;
        let (mut reader, mut w) = raw_client(addr).await;

        for (seq, delay) in [(1u32, 3u8), (2, 2), (3, 1)] {
            write(&mut w, &Message::request(1, vec![delay]).with_sequence(seq)).await;
        }

        let cancel = CancellationToken::new();
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(reader.read_message(&cancel).await.unwrap().sequence);
        }
        assert_eq!(order, vec![3, 2, 1]);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_push_is_handled_without_reply() {
        let (seen_tx, mut seen_rx) = mpsc::channel(1);
        let handler = handler_fn(move |msg: Message, done: Completion| {
            let seen_tx = seen_tx.clone();
            async move {
                assert!(done.is_detached());
                let _ = seen_tx.send(msg.command).await;
                done.reply("dropped").await
            }
        });
        let server = Server::bind("127.0.0.1:0", handler, ServerConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr();
        let requests = server.requests();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));

        let (_reader, mut w) = raw_client(addr).await;
        write(&mut w, &Message::push(8, "fire")).await;

        assert_eq!(seen_rx.recv().await, Some(8));
        assert!(requests.is_empty());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unanswered_request_is_released() {
        let (seen_tx, mut seen_rx) = mpsc::channel(4);
        let handler = handler_fn(move |msg: Message, done: Completion| {
            let seen_tx = seen_tx.clone();
            async move {
                if msg.command == 2 {
                    return done.reply(msg.body).await;
                }
                drop(done);
                let _ = seen_tx.send(msg.sequence).await;
                Ok(())
            }
        });
        let server = Server::bind("127.0.0.1:0", handler, ServerConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr();
        let conns = server.connections();
        let requests = server.requests();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));

        let (mut reader, mut w) = raw_client(addr).await;
        let ignored = Message::request(1, "").with_req_id(4).with_sequence(1);
        write(&mut w, &ignored).await;
        assert_eq!(seen_rx.recv().await, Some(1));
        assert!(requests.is_empty());
        let id = conns.conn_ids()[0];
        assert_eq!(conns.outstanding(id), 0);

        // The same key is accepted again rather than flagged as a duplicate.
        write(&mut w, &ignored).await;
        assert_eq!(seen_rx.recv().await, Some(1));

        write(&mut w, &Message::request(2, "alive").with_sequence(2)).await;
        let reply = reader.read_message(&CancellationToken::new()).await.unwrap();
        assert_eq!(reply.sequence, 2);
        assert_eq!(&reply.body[..], b"alive");
        assert!(requests.is_empty());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_clears_session() {
        let mut router = Router::new();
        router.register(1, |_msg, done| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            done.reply("").await
        });
        let server = Server::bind("127.0.0.1:0", router, ServerConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr();
        let conns = server.connections();
        let requests = server.requests();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));

        let (reader, mut w) = raw_client(addr).await;
        write(&mut w, &Message::request(1, "").with_sequence(1)).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while requests.len() != 1 || conns.len() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(reader);
        drop(w);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !conns.is_empty() || !requests.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
    }
}
