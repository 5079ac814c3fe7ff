//! Transparent CONNECT tunnel for hosts that are not intercepted

use crate::error::Result;
use crate::upstream::Upstream;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub(crate) const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub(crate) const BAD_GATEWAY: &[u8] =
  b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Splice `client` to `host:port` byte for byte.
///
/// `pre_read` holds bytes the client sent after the CONNECT head; they are
/// delivered to the destination first. A single connection attempt is made;
/// on failure the client gets `502 Bad Gateway`. The tunnel lasts until both
/// directions reach EOF or either side fails.
pub(crate) async fn tunnel(
  mut client: TcpStream,
  pre_read: Bytes,
  host: &str,
  port: u16,
  upstream: &Upstream,
) -> Result<()> {
  let mut target = match upstream.connect_tcp(host, port).await {
    Ok(target) => target,
    Err(e) => {
      tracing::debug!("[tunnel] {}:{} unreachable: {}", host, port, e);
      client.write_all(BAD_GATEWAY).await?;
      client.shutdown().await?;
      return Ok(());
    }
  };

  client.write_all(CONNECTION_ESTABLISHED).await?;
  if !pre_read.is_empty() {
    target.write_all(&pre_read).await?;
  }
  tracing::debug!("[tunnel] relaying to {}:{}", host, port);

  // A half-close is forwarded and the other direction keeps draining.
  // Resets from either peer end the tunnel; they are not proxy errors.
  match tokio::io::copy_bidirectional(&mut client, &mut target).await {
    Ok((sent, received)) => {
      tracing::debug!(
        "[tunnel] {}:{} closed, {} bytes up, {} bytes down",
        host,
        port,
        sent,
        received
      );
    }
    Err(e) => {
      tracing::debug!("[tunnel] {}:{} closed: {}", host, port, e);
    }
  }

  Ok(())
}
