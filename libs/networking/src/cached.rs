//! Peekable, rewindable cache in front of a client stream.
//!
//! Sniffers look at the first bytes of a connection before anyone decides
//! where it goes. [`CachedStream`] keeps those bytes so they can be replayed
//! verbatim to whichever consumer ends up owning the connection.
//!
//! The cache is a single fixed-size region of [`CACHE_CAPACITY`] bytes,
//! allocated on the first peek or read. Every handshake sniffed by this
//! proxy fits in it; asking for more is reported as an error instead of
//! growing the buffer.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Capacity of the connection cache (one memory page).
pub const CACHE_CAPACITY: usize = 4096;

/// A stream wrapper that remembers what it has read until released.
///
/// Bytes returned by [`peek`](Self::peek) or [`peek_until`](Self::peek_until)
/// stay available for [`rewind`](Self::rewind). Bytes delivered through
/// [`AsyncRead`] are served from the cache first and are never read from the
/// network twice.
#[derive(Debug)]
pub struct CachedStream<S> {
    inner: S,
    cache: Option<Vec<u8>>,
    cursor: usize,
    released: bool,
}

impl<S> CachedStream<S> {
    /// Wrap a stream. No memory is allocated until the first buffering need.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: None,
            cursor: 0,
            released: false,
        }
    }

    /// Cursor position inside the cache, or `None` if nothing was buffered yet.
    pub fn current_position(&self) -> Option<usize> {
        self.cache.as_ref().map(|_| self.cursor)
    }

    /// Move the cursor back to a position obtained from [`current_position`](Self::current_position).
    ///
    /// No-op when no cache exists.
    pub fn rewind(&mut self, position: usize) {
        if let Some(cache) = &self.cache {
            self.cursor = position.min(cache.len());
        }
    }

    /// Advance the cursor over `n` buffered bytes.
    pub fn consume(&mut self, n: usize) {
        if let Some(cache) = &self.cache {
            self.cursor = (self.cursor + n).min(cache.len());
        }
    }

    /// Buffered bytes from the cursor to the end of the cache.
    pub fn buffered(&self) -> &[u8] {
        match &self.cache {
            Some(cache) => &cache[self.cursor..],
            None => &[],
        }
    }

    /// Discard the cache. Later reads go straight to the inner stream.
    ///
    /// Safe to call more than once.
    pub fn release(&mut self) {
        self.cache = None;
        self.cursor = 0;
        self.released = true;
    }

    /// Whether [`release`](Self::release) has been called.
    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Drop the cache and return the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> CachedStream<S> {
    /// Make sure at least `n` bytes are buffered after the cursor and return them.
    ///
    /// The cursor does not move. Fails with `UnexpectedEof` if the stream
    /// ends first and with `InvalidInput` if the request cannot fit in the cache.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        let available = self.buffered().len();
        if available < n {
            self.fill(n - available).await?;
        }
        let start = self.cursor;
        Ok(&self.buffered_all()[start..start + n])
    }

    /// Read until one of `delimiters` shows up in the buffered region.
    ///
    /// Returns the bytes before the earliest match and the index of the
    /// delimiter that matched, and moves the cursor past the match.
    pub async fn peek_until(&mut self, delimiters: &[&[u8]]) -> io::Result<(&[u8], usize)> {
        loop {
            let window = self.buffered();
            let found = delimiters
                .iter()
                .enumerate()
                .filter(|(_, delimiter)| !delimiter.is_empty())
                .filter_map(|(index, delimiter)| {
                    find_subslice(window, delimiter).map(|at| (at, index, delimiter.len()))
                })
                .min_by_key(|(at, index, _)| (*at, *index));

            if let Some((at, index, len)) = found {
                let start = self.cursor;
                self.cursor = start + at + len;
                return Ok((&self.buffered_all()[start..start + at], index));
            }

            self.fill(1).await?;
        }
    }

    /// Read from the inner stream until `need` more bytes are buffered.
    async fn fill(&mut self, need: usize) -> io::Result<()> {
        if self.released {
            return Err(io::Error::other("connection cache already released"));
        }
        let cache = self
            .cache
            .get_or_insert_with(|| Vec::with_capacity(CACHE_CAPACITY));
        let target = cache.len() + need;
        if target > CACHE_CAPACITY {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("lookahead of {target} bytes exceeds the {CACHE_CAPACITY}-byte connection cache"),
            ));
        }

        while cache.len() < target {
            let room = CACHE_CAPACITY - cache.len();
            let n = self.inner.read_buf(&mut (&mut *cache).limit(room)).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        Ok(())
    }

    fn buffered_all(&self) -> &[u8] {
        self.cache.as_deref().unwrap_or_default()
    }
}

impl<S: AsyncWrite + Unpin> CachedStream<S> {
    /// Write the unconsumed part of the cache to `writer`, then release it.
    ///
    /// Returns the number of bytes forwarded.
    pub async fn drain_into<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<u64> {
        let pending = self.buffered().len();
        if pending > 0 {
            writer.write_all(self.buffered()).await?;
        }
        self.release();
        Ok(pending as u64)
    }

    /// Flush and shut down the write half of the inner stream.
    pub async fn shutdown_inner(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CachedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(cache) = &this.cache {
            if this.cursor < cache.len() {
                let n = (cache.len() - this.cursor).min(buf.remaining());
                buf.put_slice(&cache[this.cursor..this.cursor + n]);
                this.cursor += n;
                return Poll::Ready(Ok(()));
            }
        }

        if this.released {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        if fresh.is_empty() {
            return Poll::Ready(Ok(()));
        }

        let cache = this
            .cache
            .get_or_insert_with(|| Vec::with_capacity(CACHE_CAPACITY));
        if cache.len() + fresh.len() > CACHE_CAPACITY {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write into connection cache",
            )));
        }
        cache.extend_from_slice(fresh);
        this.cursor = cache.len();
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CachedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_peek_does_not_advance() {
        let mock = Builder::new().read(b"hello").read(b" world").build();
        let mut stream = CachedStream::new(mock);

        assert_eq!(stream.current_position(), None);
        assert_eq!(stream.peek(3).await.unwrap(), b"hel");
        assert_eq!(stream.current_position(), Some(0));
        assert_eq!(stream.peek(8).await.unwrap(), b"hello wo");
        assert_eq!(stream.current_position(), Some(0));
    }

    #[tokio::test]
    async fn test_read_serves_cache_then_stream() {
        let mock = Builder::new().read(b"abcd").read(b"efgh").build();
        let mut stream = CachedStream::new(mock);

        stream.peek(2).await.unwrap();
        stream.consume(1);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bcdefgh");
    }

    #[tokio::test]
    async fn test_rewind_replays_peeked_bytes() {
        let mock = Builder::new().read(b"\x05hello").build();
        let mut stream = CachedStream::new(mock);

        stream.peek(1).await.unwrap();
        let start = stream.current_position().unwrap();
        stream.consume(1);
        assert_eq!(stream.peek(5).await.unwrap(), b"hello");
        stream.consume(5);
        assert!(stream.buffered().is_empty());

        stream.rewind(start);
        assert_eq!(stream.buffered(), b"\x05hello");
    }

    #[tokio::test]
    async fn test_read_bytes_are_cached_for_rewind() {
        let mock = Builder::new().read(b"xyz").build();
        let mut stream = CachedStream::new(mock);

        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(stream.current_position(), Some(3));

        stream.rewind(0);
        assert_eq!(stream.peek(3).await.unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn test_peek_until_picks_earliest_delimiter() {
        let mock = Builder::new()
            .read(b"PROXY UNK")
            .read(b"NOWN\r\nrest of payload")
            .build();
        let mut stream = CachedStream::new(mock);

        let (before, which) = stream.peek_until(&[b" ", b"\r\n"]).await.unwrap();
        assert_eq!((before, which), (&b"PROXY"[..], 0));

        let (before, which) = stream.peek_until(&[b" ", b"\r\n"]).await.unwrap();
        assert_eq!((before, which), (&b"UNKNOWN"[..], 1));
        assert_eq!(stream.buffered(), b"rest of payload");
    }

    #[tokio::test]
    async fn test_peek_past_eof_fails() {
        let mock = Builder::new().read(b"ab").build();
        let mut stream = CachedStream::new(mock);

        let err = stream.peek(3).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_peek_beyond_capacity_is_rejected() {
        let (client, _server) = duplex(64);
        let mut stream = CachedStream::new(client);

        let err = stream.peek(CACHE_CAPACITY + 1).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_release_forwards_directly() {
        let (client, mut server) = duplex(64);
        let mut stream = CachedStream::new(client);

        server.write_all(b"one").await.unwrap();
        stream.peek(3).await.unwrap();

        let mut sink = Vec::new();
        assert_eq!(stream.drain_into(&mut sink).await.unwrap(), 3);
        assert_eq!(sink, b"one");
        assert!(stream.is_released());
        assert_eq!(stream.current_position(), None);

        stream.release();
        server.write_all(b"two").await.unwrap();
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
        assert_eq!(stream.current_position(), None);
    }

    #[test]
    fn test_rewind_without_cache_is_noop() {
        let (client, _server) = duplex(8);
        let mut stream = CachedStream::new(client);
        stream.rewind(10);
        assert_eq!(stream.current_position(), None);
        assert!(stream.buffered().is_empty());
    }
}
