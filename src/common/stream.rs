//! Stream abstraction
//!
//! Every inbound hands connections downstream as this unified type; nothing
//! past the dispatchers touches a raw socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, ReadBuf};

/// The core stream type delivered inside a connection context.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Look at the first byte of a buffered stream without consuming it.
///
/// Returns `None` on EOF. The byte stays in the buffer, so a handshake
/// continuing from the same reader sees it again.
pub async fn peek_one<S>(stream: &mut S) -> io::Result<Option<u8>>
where
    S: AsyncBufRead + Unpin,
{
    let buf = stream.fill_buf().await?;
    Ok(buf.first().copied())
}

/// Stream wrapper that replays pre-read data before the underlying stream.
///
/// Used by the HTTP forward path to hand the already-parsed request to the
/// receiver of the connection context.
pub struct PrependStream {
    prepend: BytesMut,
    inner: Stream,
}

impl PrependStream {
    pub fn new(prepend: BytesMut, inner: Stream) -> Self {
        Self { prepend, inner }
    }
}

impl AsyncRead for PrependStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prepend.is_empty() {
            let to_copy = self.prepend.len().min(buf.remaining());
            buf.put_slice(&self.prepend[..to_copy]);
            let _ = self.prepend.split_to(to_copy);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrependStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
