//! Stream handle.

use crate::session::Shared;
use bytes::Bytes;
use knit_core::{Error, Result};
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// One bidirectional stream of a [`Session`](crate::Session).
///
/// Implements [`AsyncRead`] and [`AsyncWrite`], so protocol negotiation and
/// any tokio codec can run on it directly. Dropping a stream that is not yet
/// closed in both directions resets it.
pub struct Stream {
    id: u32,
    shared: Arc<Shared>,
}

impl Stream {
    pub(crate) fn new(id: u32, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    /// Stream id. Odd for initiator-opened streams, even for responder-opened.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Read up to `max` bytes.
    ///
    /// Returns `Ok(None)` once the peer has sent FIN and everything before it
    /// has been read.
    ///
    /// # Errors
    ///
    /// `StreamReset` after RST from either side, `SessionClosed` once the
    /// session has ended.
    pub async fn read(&mut self, max: usize) -> Result<Option<Bytes>> {
        if max == 0 {
            return Ok(Some(Bytes::new()));
        }
        poll_fn(|cx| self.shared.poll_read(self.id, cx, max)).await
    }

    /// Write all of `data`, waiting for window credit as needed.
    ///
    /// Cancelling the future may leave a prefix of `data` sent.
    ///
    /// # Errors
    ///
    /// `WriteAfterClose` after [`close_write`](Self::close_write),
    /// `StreamReset` after RST, `SessionClosed` once the session has ended.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = poll_fn(|cx| self.shared.poll_write(self.id, cx, data)).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Send FIN. Reading continues until the peer's FIN.
    pub fn close_write(&mut self) -> Result<()> {
        self.shared.close_write(self.id)
    }

    /// Abort both directions and discard buffered data.
    pub fn reset(&mut self) -> Result<()> {
        self.shared.reset(self.id)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        match self.shared.poll_read(self.id, cx, buf.remaining()) {
            Poll::Ready(Ok(Some(chunk))) => {
                buf.put_slice(&chunk);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(None)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.shared
            .poll_write(self.id, cx, buf)
            .map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are queued for the writer task as soon as they are accepted.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.shared.close_write(self.id) {
            Ok(()) | Err(Error::WriteAfterClose) => Poll::Ready(Ok(())),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }
}
