//! Stream wrapper that replays consumed bytes
//!
//! The listener demultiplexes on a single peeked byte, and the HTTP handler
//! buffers ahead while scanning for line endings. Both hand the connection on
//! with any consumed-but-unprocessed bytes pushed back in front of the stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Maximum accepted header line length
const MAX_LINE: usize = 64 * 1024;

/// Stream with a replay buffer drained ahead of the inner stream.
pub struct PrependStream<S> {
    pending: BytesMut,
    inner: S,
}

impl<S> PrependStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            pending: BytesMut::new(),
            inner,
        }
    }

    /// Wrap a stream with bytes already read from it.
    pub fn with_prefix(prefix: &[u8], inner: S) -> Self {
        Self {
            pending: BytesMut::from(prefix),
            inner,
        }
    }

    /// Bytes buffered but not yet returned to a reader.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn into_inner(self) -> (BytesMut, S) {
        (self.pending, self.inner)
    }
}

impl<S: AsyncRead + Unpin> PrependStream<S> {
    /// Read one CR/LF-terminated line, stripping the terminator.
    ///
    /// Bytes beyond the line stay in the replay buffer, so interleaving
    /// `read_line` with raw reads never loses data.
    pub async fn read_line(&mut self) -> std::io::Result<String> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line = self.pending.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line);
                return Ok(text.trim_end_matches(['\r', '\n']).to_string());
            }
            if self.pending.len() > MAX_LINE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "header line too long",
                ));
            }

            let mut buf = [0u8; 4096];
            let n = self.inner.read(&mut buf).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrependStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.pending.is_empty() {
            let to_copy = self.pending.len().min(buf.remaining());
            buf.put_slice(&self.pending[..to_copy]);
            let _ = self.pending.split_to(to_copy);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrependStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
