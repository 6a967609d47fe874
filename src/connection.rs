//! Client-side connection: one socket, request/reply correlation and liveness.
//!
//! A [`Connection`] is `Open` from the moment [`Connection::start`] returns
//! until [`Connection::close`] runs. Closing is idempotent: the first call
//! cancels the connection token, which stops the read loop, the three
//! tickers and the writer task (dropping both socket halves). Replies still
//! pending are dropped after [`CLOSE_GRACE`], at which point the state
//! becomes `Closed`.
//!
//! ```text
//!            ┌──────────── read loop ◄── socket read half
//!            │                 │
//! caller ─► send ─► pending ◄──┘ (Reply by sequence)
//!            │
//!            └─► writer task ─► socket write half
//!                   ▲
//!  ping / idle / live tickers
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{Result, RpcError};
use crate::pool::Poolable;
use crate::protocol::{encode_message, Message, MessageReader, PkgType, RESULT_OK};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Delay between `close()` and dropping the pending reply senders.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Slack added to every ping deadline.
pub const PING_GRACE: Duration = Duration::from_secs(1);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection id, shared by client and server sessions.
pub(crate) fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepting sends.
    Open,
    /// `close()` ran; pending replies not yet drained.
    Closing,
    /// Fully torn down.
    Closed,
}

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<Message>>>>;

struct Deadlines {
    ping: Instant,
    idle: Instant,
    live: Instant,
}

/// A client connection to one remote address.
pub struct Connection {
    id: u64,
    peer: String,
    config: ConnectionConfig,
    state: Arc<AtomicU8>,
    sequence: AtomicU32,
    pending: Pending,
    deadlines: Mutex<Deadlines>,
    writer: WriterHandle,
    ctx: CancellationToken,
}

impl Connection {
    /// Take ownership of `stream` and start the background tasks.
    ///
    /// Push frames from the peer go to `push_tx`; without one they are dropped.
    pub fn start<S>(
        stream: S,
        peer: impl Into<String>,
        config: ConnectionConfig,
        push_tx: Option<mpsc::Sender<Message>>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let ctx = CancellationToken::new();
        let (writer, writer_task) = spawn_writer_task(write_half, config.write_queue, ctx.clone());

        let now = Instant::now();
        let conn = Arc::new(Self {
            id: next_conn_id(),
            peer: peer.into(),
            state: Arc::new(AtomicU8::new(OPEN)),
            sequence: AtomicU32::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            deadlines: Mutex::new(Deadlines {
                ping: now + config.ping_timeout + PING_GRACE,
                idle: now + config.idle_timeout,
                live: now + config.live_timeout,
            }),
            writer,
            ctx,
            config,
        });
        debug!(conn_id = conn.id, peer = %conn.peer, "Connection open");

        let reader = MessageReader::new(read_half, conn.config.max_body_size);
        tokio::spawn(Arc::clone(&conn).read_loop(reader, push_tx));
        tokio::spawn(Arc::clone(&conn).ping_loop());
        tokio::spawn(Arc::clone(&conn).idle_loop());
        tokio::spawn(Arc::clone(&conn).live_loop());

        let watcher = Arc::clone(&conn);
        tokio::spawn(async move {
            if let Ok(Err(e)) = writer_task.await {
                debug!(conn_id = watcher.id, error = %e, "Writer stopped");
                watcher.close();
            }
        });

        conn
    }

    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address this connection was opened to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            OPEN => ConnState::Open,
            CLOSING => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    /// Whether sends are accepted.
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Replies still awaited.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Next sequence number. Never 0; wraps after `u32::MAX`.
    pub fn next_sequence(&self) -> u32 {
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Encode and write `msg`; register `reply` under its sequence first.
    ///
    /// # Errors
    ///
    /// [`RpcError::ConnectionClosed`] if the connection is not open, an
    /// encoding error, or the write error (which also closes the connection).
    pub async fn send(&self, msg: Message, reply: Option<oneshot::Sender<Message>>) -> Result<()> {
        if !self.is_open() {
            return Err(RpcError::ConnectionClosed);
        }

        let bytes = encode_message(&msg, self.config.max_body_size)?;
        let seq = msg.sequence;
        let registered = reply.is_some();
        if let Some(tx) = reply {
            self.pending.lock().insert(seq, tx);
        }

        if let Err(e) = self.writer.send(bytes).await {
            if registered {
                self.pending.lock().remove(&seq);
            }
            warn!(conn_id = self.id, seq, error = %e, "Send failed, closing");
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Send `msg` and return the receiver its reply will arrive on.
    pub async fn request(&self, msg: Message) -> Result<oneshot::Receiver<Message>> {
        let (tx, rx) = oneshot::channel();
        self.send(msg, Some(tx)).await?;
        Ok(rx)
    }

    /// Stop waiting for the reply to `sequence`.
    pub fn forget(&self, sequence: u32) {
        self.pending.lock().remove(&sequence);
    }

    /// Close the connection. Only the first call has an effect.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(conn_id = self.id, peer = %self.peer, "Connection closing");
        self.ctx.cancel();

        let pending = Arc::clone(&self.pending);
        let state = Arc::clone(&self.state);
        let id = self.id;
        let drain = move || {
            let dropped = std::mem::take(&mut *pending.lock()).len();
            state.store(CLOSED, Ordering::Release);
            debug!(conn_id = id, dropped, "Connection closed");
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(CLOSE_GRACE).await;
                    drain();
                });
            }
            Err(_) => drain(),
        }
    }

    /// Token cancelled when the connection starts closing.
    pub fn closed(&self) -> CancellationToken {
        self.ctx.clone()
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: MessageReader<R>, push_tx: Option<mpsc::Sender<Message>>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match reader.read_message(&self.ctx).await {
                Ok(msg) => self.dispatch(msg, push_tx.as_ref()).await,
                Err(RpcError::ContextCanceled) => break,
                Err(RpcError::ConnectionClosed) => {
                    debug!(conn_id = self.id, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(conn_id = self.id, error = %e, "Read failed");
                    break;
                }
            }
        }
        self.close();
    }

    async fn dispatch(&self, msg: Message, push_tx: Option<&mpsc::Sender<Message>>) {
        let now = Instant::now();

        if msg.is_heartbeat_request() {
            let requested = msg
                .heartbeat
                .map(|hb| Duration::from_millis(u64::from(hb.timeout_ms)))
                .unwrap_or(self.config.ping_timeout);
            self.deadlines.lock().ping = now + requested + PING_GRACE;
            trace!(conn_id = self.id, seq = msg.sequence, "Heartbeat request");

            let pong = Message::reply_to(&msg, RESULT_OK, Bytes::new());
            match encode_message(&pong, self.config.max_body_size) {
                Ok(bytes) => {
                    if let Err(e) = self.writer.enqueue(bytes).await {
                        debug!(conn_id = self.id, error = %e, "Heartbeat reply not sent");
                    }
                }
                Err(e) => warn!(conn_id = self.id, error = %e, "Heartbeat reply encode failed"),
            }
            return;
        }

        if msg.is_heartbeat_reply() {
            self.deadlines.lock().ping = now + self.config.ping_timeout + PING_GRACE;
            trace!(conn_id = self.id, seq = msg.sequence, "Heartbeat reply");
            return;
        }

        self.deadlines.lock().idle = now + self.config.idle_timeout;

        match msg.pkg_type {
            PkgType::Reply => {
                let waiter = self.pending.lock().remove(&msg.sequence);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => warn!(
                        conn_id = self.id,
                        seq = msg.sequence,
                        command = msg.command,
                        "Reply without pending request"
                    ),
                }
            }
            PkgType::Push => match push_tx {
                Some(tx) => {
                    if let Err(e) = tx.try_send(msg) {
                        warn!(conn_id = self.id, error = %e, "Push dropped");
                    }
                }
                None => warn!(conn_id = self.id, command = msg.command, "Push dropped, no receiver"),
            },
            PkgType::Request | PkgType::Unknown(_) => warn!(
                conn_id = self.id,
                command = msg.command,
                pkg_type = msg.pkg_type.to_u16(),
                "Unexpected frame on client connection"
            ),
        }
    }

    async fn ping_loop(self: Arc<Self>) {
        let mut tick = ticker(self.config.ping_interval);
        let timeout_ms = u32::try_from(self.config.ping_timeout.as_millis()).unwrap_or(u32::MAX);

        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => return,
                _ = tick.tick() => {}
            }

            if Instant::now() > self.deadlines.lock().ping {
                warn!(conn_id = self.id, peer = %self.peer, "Heartbeat timeout");
                self.close();
                return;
            }

            let ping = Message::heartbeat_request(timeout_ms).with_sequence(self.next_sequence());
            let sent = encode_message(&ping, self.config.max_body_size)
                .and_then(|bytes| self.writer.try_enqueue(bytes));
            if let Err(e) = sent {
                trace!(conn_id = self.id, error = %e, "Heartbeat not queued");
            }
        }
    }

    async fn idle_loop(self: Arc<Self>) {
        let mut tick = ticker(self.config.idle_check_interval);
        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => return,
                _ = tick.tick() => {}
            }

            let expired = Instant::now() > self.deadlines.lock().idle;
            if expired && self.pending_len() == 0 {
                debug!(conn_id = self.id, "Idle timeout");
                self.close();
                return;
            }
        }
    }

    async fn live_loop(self: Arc<Self>) {
        let mut tick = ticker(self.config.live_check_interval);
        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => return,
                _ = tick.tick() => {}
            }

            let expired = Instant::now() > self.deadlines.lock().live;
            if expired && self.pending_len() == 0 {
                debug!(conn_id = self.id, "Live timeout");
                self.close();
                return;
            }
        }
    }
}

impl Poolable for Connection {
    fn close(&self) {
        Connection::close(self);
    }

    fn is_closed(&self) -> bool {
        !self.is_open()
    }

    fn close_notify(&self) -> CancellationToken {
        self.closed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Interval whose first tick is one period from now.
fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}
