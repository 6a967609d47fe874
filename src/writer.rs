//! Dedicated writer task for sending frames on one socket.
//!
//! Every connection owns a writer task that receives encoded frames via an
//! mpsc channel. Producers never hold a lock on the socket, and frames that
//! queue up while a write is in flight go out together in one vectored write.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ──┐
//! Ping loop ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► TCP write half
//! Handler N ─┘
//! ```
//!
//! A frame may carry an acknowledgement channel, completed once the bytes have
//! been handed to the socket (or the write failed).

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

type Ack = oneshot::Sender<std::io::Result<()>>;

/// An encoded frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Header, ext and body, contiguous.
    pub bytes: Bytes,
    ack: Option<Ack>,
}

impl OutboundFrame {
    /// Frame without acknowledgement.
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes, ack: None }
    }

    /// Frame whose outcome is reported on the returned receiver.
    #[inline]
    pub fn acked(bytes: Bytes) -> (Self, oneshot::Receiver<std::io::Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                bytes,
                ack: Some(tx),
            },
            rx,
        )
    }

    /// Total size of this frame.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn complete(self, outcome: &std::io::Result<()>) {
        if let Some(ack) = self.ack {
            let result = match outcome {
                Ok(()) => Ok(()),
                Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
            };
            let _ = ack.send(result);
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame and wait until it has been written.
    ///
    /// # Errors
    ///
    /// [`RpcError::Io`] if the socket write failed, [`RpcError::ConnectionClosed`]
    /// if the writer task is gone before the frame was written.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        let (frame, ack) = OutboundFrame::acked(bytes);
        self.tx
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)?;

        match ack.await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Queue a frame without waiting for the write.
    pub async fn enqueue(&self, bytes: Bytes) -> Result<()> {
        self.tx
            .send(OutboundFrame::new(bytes))
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Queue a frame without waiting for channel capacity.
    ///
    /// Fails with [`RpcError::ConnectionClosed`] if the queue is full or the
    /// writer is gone.
    pub fn try_enqueue(&self, bytes: Bytes) -> Result<()> {
        self.tx
            .try_send(OutboundFrame::new(bytes))
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task stops when every handle is dropped, when `cancel` fires, or on the
/// first write error. It shuts the write half down on exit.
pub fn spawn_writer_task<W>(
    writer: W,
    channel_capacity: usize,
    cancel: CancellationToken,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer, cancel));
    (WriterHandle { tx }, task)
}

/// Main writer loop - receives frames and writes them in batches.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let outcome = loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break Ok(()),
            },
        };

        // Collect additional ready frames (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        // A peer that stops reading must not pin this task past cancellation.
        let written = tokio::select! {
            _ = cancel.cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "writer cancelled mid-write",
            )),
            written = write_batch(&mut writer, &batch) => written,
        };
        for frame in batch {
            frame.complete(&written);
        }
        if let Err(e) = written {
            if cancel.is_cancelled() {
                break Ok(());
            }
            warn!(error = %e, "Write failed, stopping writer");
            break Err(RpcError::Io(e));
        }
    };

    // Queued frames are dropped here; their ack receivers observe closure.
    rx.close();
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Shutdown of write half failed");
    }
    outcome
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let start = offset;
        let end = offset + frame.size();
        if skip_bytes < end && !frame.bytes.is_empty() {
            let start_in_frame = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&frame.bytes[start_in_frame..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(len: usize, fill: u8) -> OutboundFrame {
        OutboundFrame::new(Bytes::from(vec![fill; len]))
    }

    #[tokio::test]
    async fn test_send_waits_for_write() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, 16, CancellationToken::new());

        handle.send(Bytes::from_static(b"hello")).await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_batched_frames_arrive_in_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, 64, CancellationToken::new());

        for i in 0..10u8 {
            handle.enqueue(Bytes::from(vec![i; 4])).await.unwrap();
        }

        let mut buf = vec![0u8; 40];
        server.read_exact(&mut buf).await.unwrap();
        for (i, chunk) in buf.chunks(4).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_writer_and_fails_send() {
        let (client, _server) = duplex(4096);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_writer_task(client, 16, cancel.clone());

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());

        let err = handle.send(Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_write_error_reported_to_ack() {
        let (client, server) = duplex(16);
        drop(server);
        let (handle, task) = spawn_writer_task(client, 16, CancellationToken::new());

        let err = handle.send(Bytes::from_static(b"into the void")).await.unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_try_enqueue_full_queue() {
        let (client, _server) = duplex(1);
        let (handle, _task) = spawn_writer_task(client, 1, CancellationToken::new());

        // The duplex holds one byte, so the writer stalls on the first frame.
        handle.enqueue(Bytes::from(vec![1u8; 64])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.enqueue(Bytes::from(vec![2u8; 64])).await.unwrap();

        assert!(handle.try_enqueue(Bytes::from_static(b"x")).is_err());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_write() {
        let (client, _server) = duplex(1);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_writer_task(client, 4, cancel.clone());

        let stalled = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(Bytes::from(vec![7u8; 256])).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("writer still blocked after cancel")
            .unwrap();
        assert!(outcome.is_ok());
        assert!(matches!(stalled.await.unwrap(), Err(RpcError::Io(_))));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, 16, CancellationToken::new());

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![frame(10, 1), frame(5, 2)];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_partial_first() {
        let batch = vec![frame(10, 1), frame(5, 2)];
        let slices = build_remaining_slices(&batch, 4);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 6);
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_build_remaining_slices_skip_first() {
        let batch = vec![frame(10, 1), frame(5, 2)];
        let slices = build_remaining_slices(&batch, 12);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 3);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| frame(3, i)).collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 15);
    }
}
