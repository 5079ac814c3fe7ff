//! Stream replaying bytes consumed while parsing a request head

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Yields `prefix` before reading from `inner`; writes go straight through.
pub struct PrefixedStream<T> {
  prefix: Bytes,
  inner: T,
}

impl<T> PrefixedStream<T> {
  pub fn new(prefix: Bytes, inner: T) -> Self {
    Self { prefix, inner }
  }
}

impl<T: AsyncRead + Unpin> AsyncRead for PrefixedStream<T> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    if !self.prefix.is_empty() {
      let n = self.prefix.len().min(buf.remaining());
      buf.put_slice(&self.prefix[..n]);
      self.prefix.advance(n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<T> {
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

  fn poll_write_vectored(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    bufs: &[io::IoSlice<'_>],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
  }

  fn is_write_vectored(&self) -> bool {
    self.inner.is_write_vectored()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn test_prefix_is_read_first() {
    let (client, mut server) = tokio::io::duplex(64);
    server.write_all(b" world").await.unwrap();
    drop(server);

    let mut stream = PrefixedStream::new(Bytes::from_static(b"hello"), client);
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "hello world");
  }

  #[tokio::test]
  async fn test_writes_bypass_prefix() {
    let (client, mut server) = tokio::io::duplex(64);
    let mut stream = PrefixedStream::new(Bytes::from_static(b"ignored"), client);
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
  }
}
