//! Live server sessions.
//!
//! The [`ConnManager`] owns one entry per accepted socket: its writer, its
//! cancellation token and the set of requests still outstanding on it.
//! Replies and server pushes find their socket here by connection id.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::registry::{RequestKey, RequestRegistry};
use crate::error::{Result, RpcError};
use crate::protocol::{encode_message, Message};
use crate::writer::WriterHandle;

struct Session {
    peer: SocketAddr,
    writer: WriterHandle,
    cancel: CancellationToken,
    keys: Mutex<HashSet<RequestKey>>,
}

/// Registry of connected sessions, keyed by connection id.
pub struct ConnManager {
    sessions: DashMap<u64, Arc<Session>>,
    max_body_size: u32,
}

impl ConnManager {
    pub(crate) fn new(max_body_size: u32) -> Self {
        Self {
            sessions: DashMap::new(),
            max_body_size,
        }
    }

    /// Register a new session with an empty key set.
    pub(crate) fn on_connect(
        &self,
        conn_id: u64,
        peer: SocketAddr,
        writer: WriterHandle,
        cancel: CancellationToken,
    ) {
        let session = Session {
            peer,
            writer,
            cancel,
            keys: Mutex::new(HashSet::new()),
        };
        self.sessions.insert(conn_id, Arc::new(session));
        debug!(conn_id, %peer, sessions = self.sessions.len(), "Session registered");
    }

    /// Remove a session, stop its tasks and forget its outstanding requests.
    ///
    /// Returns the number of requests that will never be answered.
    pub(crate) fn on_disconnect(&self, conn_id: u64, registry: &RequestRegistry) -> usize {
        let Some((_, session)) = self.sessions.remove(&conn_id) else {
            return 0;
        };
        session.cancel.cancel();

        let keys = std::mem::take(&mut *session.keys.lock());
        let abandoned = keys.iter().filter(|key| registry.take(key)).count();
        debug!(
            conn_id,
            peer = %session.peer,
            abandoned,
            sessions = self.sessions.len(),
            "Session removed"
        );
        abandoned
    }

    /// Attach an outstanding request to its session.
    ///
    /// Returns `false` if the session is already gone.
    pub(crate) fn track(&self, key: RequestKey) -> bool {
        match self.sessions.get(&key.conn_id) {
            Some(session) => {
                session.keys.lock().insert(key);
                true
            }
            None => false,
        }
    }

    /// Detach an answered request from its session.
    pub(crate) fn untrack(&self, key: &RequestKey) {
        if let Some(session) = self.sessions.get(&key.conn_id) {
            session.keys.lock().remove(key);
        }
    }

    pub(crate) fn writer(&self, conn_id: u64) -> Option<WriterHandle> {
        self.sessions
            .get(&conn_id)
            .map(|session| session.writer.clone())
    }

    pub(crate) fn max_body_size(&self) -> u32 {
        self.max_body_size
    }

    /// Send `msg` to one session as is.
    ///
    /// Waits for queue space, not for the bytes to reach the socket.
    pub async fn push(&self, conn_id: u64, msg: Message) -> Result<()> {
        let writer = self.writer(conn_id).ok_or(RpcError::ConnectionClosed)?;
        let bytes = encode_message(&msg, self.max_body_size)?;
        writer.enqueue(bytes).await
    }

    /// Send `msg` to every session. Returns how many sessions accepted it.
    pub async fn broadcast(&self, msg: Message) -> Result<usize> {
        let bytes = encode_message(&msg, self.max_body_size)?;
        let writers: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.writer.clone())
            .collect();

        let mut sent = 0;
        for writer in writers {
            if writer.enqueue(bytes.clone()).await.is_ok() {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Peer address of a session.
    pub fn peer(&self, conn_id: u64) -> Option<SocketAddr> {
        self.sessions.get(&conn_id).map(|session| session.peer)
    }

    /// Ids of all connected sessions.
    pub fn conn_ids(&self) -> Vec<u64> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Requests still outstanding on a session.
    pub fn outstanding(&self, conn_id: u64) -> usize {
        self.sessions
            .get(&conn_id)
            .map_or(0, |session| session.keys.lock().len())
    }

    /// Number of connected sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// `true` if no session is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cancel every session. Entries are removed by their read tasks.
    /// Cancel one session's tasks. Its entry is removed by the session itself.
    pub(crate) fn close_session(&self, conn_id: u64) -> bool {
        match self.sessions.get(&conn_id) {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ConnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnManager")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
