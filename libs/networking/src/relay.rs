//! Bidirectional relay between a cached client stream and an upstream.
//!
//! Any bytes still sitting in the client's cache are written upstream first
//! and the cache is released, so the handshake a sniffer looked at reaches
//! the server verbatim. After that two copy loops run over pooled buffers.
//! Whichever direction ends first closes the write side of both streams,
//! which in turn ends the other loop.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cached::CachedStream;
use crate::pool::BufferPool;

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to upstream, including drained cache bytes.
    pub uploaded: u64,
    /// Upstream to client.
    pub downloaded: u64,
}

impl RelayStats {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.uploaded + self.downloaded
    }
}

/// Relay until either side closes.
pub async fn relay<S, U>(
    client: &mut CachedStream<S>,
    upstream: &mut U,
    pool: &Arc<BufferPool>,
) -> io::Result<RelayStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut stats = RelayStats {
        uploaded: client.drain_into(upstream).await?,
        downloaded: 0,
    };

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut uploaded = 0u64;
    let mut downloaded = 0u64;
    let result = tokio::select! {
        r = copy_loop(&mut client_read, &mut upstream_write, pool, &mut uploaded) => {
            debug!(direction = "upload", "Relay direction finished first");
            r
        }
        r = copy_loop(&mut upstream_read, &mut client_write, pool, &mut downloaded) => {
            debug!(direction = "download", "Relay direction finished first");
            r
        }
    };

    close_write(&mut upstream_write, "upstream").await;
    close_write(&mut client_write, "client").await;

    stats.uploaded += uploaded;
    stats.downloaded = downloaded;
    result.map(|()| stats)
}

/// Half-close `writer`. The peer may already be gone, so failures only
/// matter for debugging.
async fn close_write<W: AsyncWrite + Unpin>(writer: &mut W, side: &'static str) {
    if let Err(e) = writer.shutdown().await {
        debug!(side, error = %e, "Failed to shut down write half");
    }
}

async fn copy_loop<R, W>(
    reader: &mut R,
    writer: &mut W,
    pool: &Arc<BufferPool>,
    written: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = pool.get();
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if is_closed(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        match writer.write_all(&buffer[..n]).await {
            Ok(()) => *written += n as u64,
            Err(e) if is_closed(&e) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn is_closed(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    /// Duplex stream whose shutdown always fails.
    struct StubbornShutdown(DuplexStream);

    impl AsyncRead for StubbornShutdown {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StubbornShutdown {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "already closed")))
        }
    }

    #[tokio::test]
    async fn test_relay_replays_cache_first() {
        let (client_side, mut client_peer) = duplex(1024);
        let (upstream_side, mut upstream_peer) = duplex(1024);
        let pool = Arc::new(BufferPool::new(4, 64));

        client_peer.write_all(b"handshake").await.unwrap();
        let mut client = CachedStream::new(client_side);
        client.peek(9).await.unwrap();
        client.consume(4);

        let task = tokio::spawn(async move {
            let mut upstream = upstream_side;
            relay(&mut client, &mut upstream, &pool).await
        });

        let mut buf = [0u8; 5];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"shake");

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(upstream_peer);
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { uploaded: 9, downloaded: 4 });
        assert_eq!(stats.total(), 13);

        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_client_close_ends_relay() {
        let (client_side, client_peer) = duplex(64);
        let (upstream_side, mut upstream_peer) = duplex(64);
        let pool = Arc::new(BufferPool::new(4, 64));

        let task = tokio::spawn(async move {
            let mut client = CachedStream::new(client_side);
            let mut upstream = upstream_side;
            relay(&mut client, &mut upstream, &pool).await
        });

        drop(client_peer);
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats::default());

        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_failed_half_close_still_reports_stats() {
        let (client_side, client_peer) = duplex(64);
        let (upstream_side, mut upstream_peer) = duplex(64);
        let pool = Arc::new(BufferPool::new(4, 64));

        upstream_peer.write_all(b"bye").await.unwrap();
        drop(upstream_peer);

        let mut client = CachedStream::new(client_side);
        let mut upstream = StubbornShutdown(upstream_side);
        let stats = relay(&mut client, &mut upstream, &pool).await.unwrap();
        assert_eq!(stats, RelayStats { uploaded: 0, downloaded: 3 });
        drop(client_peer);
    }
}
