//! Async message reader over any `AsyncRead`.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::frame::Message;
use super::frame_buffer::FrameBuffer;
use crate::error::{Result, RpcError};

/// Read buffer size per syscall.
const READ_CHUNK: usize = 64 * 1024;

/// Decodes messages from a byte stream, looping over short reads.
pub struct MessageReader<R> {
    inner: R,
    frames: FrameBuffer,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a reader with the given body limit.
    pub fn new(inner: R, max_body_size: u32) -> Self {
        Self {
            inner,
            frames: FrameBuffer::with_max_body(max_body_size),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Read the next complete message.
    ///
    /// # Errors
    ///
    /// - [`RpcError::ConnectionClosed`] on a clean EOF at a frame boundary
    /// - [`RpcError::HeaderTooShort`] when the stream ends inside a header
    /// - [`RpcError::Io`] on read failure or EOF inside ext/body
    /// - [`RpcError::ContextCanceled`] when `cancel` fires
    pub async fn read_message(&mut self, cancel: &CancellationToken) -> Result<Message> {
        loop {
            if let Some(msg) = self.frames.next_message() {
                return Ok(msg);
            }

            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(RpcError::ContextCanceled),
                read = self.inner.read(&mut self.chunk) => read?,
            };

            if n == 0 {
                return Err(self.eof_error());
            }
            self.frames.extend(&self.chunk[..n]);
        }
    }

    fn eof_error(&self) -> RpcError {
        if self.frames.is_mid_frame() {
            RpcError::Io(std::io::ErrorKind::UnexpectedEof.into())
        } else if !self.frames.is_empty() {
            RpcError::HeaderTooShort {
                have: self.frames.len(),
            }
        } else {
            RpcError::ConnectionClosed
        }
    }

    /// Noise bytes discarded so far.
    pub fn discarded(&self) -> u64 {
        self.frames.discarded()
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}
