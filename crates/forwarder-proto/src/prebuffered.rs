//! A manually controllable prebuffer for Tokio streams.
//!
//! [`Prebuffered`] wraps a stream so a header section can be accumulated and
//! inspected before anything is consumed. Bytes left in the buffer after the
//! header section are handed out first by `AsyncRead`, then reads fall through
//! to the inner stream. Writes always go straight to the inner stream.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// A prebuffering wrapper around a stream.
pub struct Prebuffered<S> {
    inner: S,
    buf: BytesMut,
    max_len: usize,
}

impl<S> Prebuffered<S> {
    /// Creates a new wrapper that buffers at most `max_len` bytes.
    pub fn new(inner: S, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Discards `n` bytes from the front of the buffer.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Returns the buffered bytes and the inner stream.
    pub fn into_parts(self) -> (Bytes, S) {
        (self.buf.freeze(), self.inner)
    }
}

impl<S: AsyncRead + Unpin> Prebuffered<S> {
    /// Buffers more data from the inner stream. Returns 0 on EOF or when full.
    pub async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        if max == 0 {
            return Ok(0);
        }
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
