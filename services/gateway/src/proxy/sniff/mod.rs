//! Protocol sniffers.
//!
//! A sniffer looks at the cached opening bytes of a connection and fills in
//! a metadata sub-record. Sniffing never consumes the stream for whoever
//! handles the connection later: after every attempt the cache cursor goes
//! back to where the caller started.

pub mod minecraft;
pub mod tls;

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use craftgate_networking::varint::{decode_varint_prefix, MAX_VARINT_LEN};
use craftgate_networking::CachedStream;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ConfigError, SniffError};
use crate::metadata::Metadata;

/// Per-step read deadline while sniffing.
pub const SNIFF_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Sniff every registered protocol.
pub const ALL_PROTOCOLS: &str = "all";

/// An accepted client connection behind its cache.
pub type ClientConn = CachedStream<TcpStream>;

#[async_trait]
pub trait Sniffer: Send + Sync {
    /// Parse the cached bytes at the cursor and fill in `metadata`.
    ///
    /// The cursor may be left anywhere; the caller rewinds.
    async fn sniff(&self, conn: &mut ClientConn, metadata: &mut Metadata) -> Result<(), SniffError>;
}

/// Sniffers by protocol name.
#[derive(Clone)]
pub struct SnifferRegistry {
    sniffers: BTreeMap<String, Arc<dyn Sniffer>>,
}

impl SnifferRegistry {
    /// Registry with no sniffers.
    pub fn empty() -> Self {
        Self {
            sniffers: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `minecraft` and `tls` sniffers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("minecraft", Arc::new(minecraft::MinecraftSniffer::default()));
        registry.register("tls", Arc::new(tls::TlsSniffer::default()));
        registry
    }

    pub fn register(&mut self, protocol: impl Into<String>, sniffer: Arc<dyn Sniffer>) {
        self.sniffers.insert(protocol.into(), sniffer);
    }

    /// Check that every name refers to a registered sniffer or to `all`.
    pub fn validate<S: AsRef<str>>(&self, protocols: &[S]) -> Result<(), ConfigError> {
        for protocol in protocols {
            let protocol = protocol.as_ref();
            if protocol != ALL_PROTOCOLS && !self.sniffers.contains_key(protocol) {
                return Err(ConfigError::UnknownSniffer(protocol.to_string()));
            }
        }
        Ok(())
    }

    /// Run the sniffers for `protocols`, rewinding to `start` after each attempt.
    ///
    /// Each protocol is attempted at most once per connection. Failures are
    /// logged and otherwise ignored: the connection falls back to whatever
    /// the rules decide without the sub-record.
    pub async fn sniff<S: AsRef<str>>(
        &self,
        conn: &mut ClientConn,
        metadata: &mut Metadata,
        protocols: &[S],
        start: usize,
    ) {
        for protocol in protocols {
            let protocol = protocol.as_ref();
            if protocol == ALL_PROTOCOLS {
                for (name, sniffer) in &self.sniffers {
                    self.attempt(name, sniffer.as_ref(), conn, metadata, start).await;
                }
            } else if let Some(sniffer) = self.sniffers.get(protocol) {
                self.attempt(protocol, sniffer.as_ref(), conn, metadata, start).await;
            }
        }
    }

    async fn attempt(
        &self,
        protocol: &str,
        sniffer: &dyn Sniffer,
        conn: &mut ClientConn,
        metadata: &mut Metadata,
        start: usize,
    ) {
        if !metadata.mark_sniffed(protocol) {
            return;
        }
        if let Err(e) = sniffer.sniff(conn, metadata).await {
            debug!(id = %metadata.id, protocol, error = %e, timeout = e.is_timeout(), "Sniff failed");
        }
        conn.rewind(start);
    }
}

impl Default for SnifferRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for SnifferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.sniffers.keys()).finish()
    }
}

/// Bound one read step by `step`, reporting expiry as `TimedOut`.
pub(crate) async fn timed<T>(
    step: Duration,
    future: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match tokio::time::timeout(step, future).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "sniff step timed out")),
    }
}

/// Read a VarInt at the cursor and move past it.
pub(crate) async fn read_varint<S: AsyncRead + Unpin>(
    conn: &mut CachedStream<S>,
    step: Duration,
) -> Result<i32, SniffError> {
    for len in 1..=MAX_VARINT_LEN {
        let prefix = timed(step, conn.peek(len)).await?;
        if let Some((value, used)) = decode_varint_prefix(prefix)? {
            conn.consume(used);
            return Ok(value);
        }
    }
    Err(SniffError::BadPacket("varint too big"))
}
