//! Stream-level building blocks for the craftgate proxy.
//!
//! This library provides:
//! - A peekable, rewindable cache in front of a client stream ([`CachedStream`])
//! - Minecraft wire primitives (varints, strings, packet framing)
//! - PROXY protocol v1/v2 header encoding and decoding
//! - Compiled matchers for domains, IP ranges and string lists
//! - A scratch buffer pool and a cache-draining bidirectional relay
//!
//! Nothing in here knows about routing rules or outbounds; the gateway
//! service composes these pieces.

pub mod cached;
pub mod domain;
pub mod ipset;
pub mod pool;
pub mod proxy_protocol;
pub mod relay;
pub mod set;
pub mod varint;

pub use cached::{CachedStream, CACHE_CAPACITY};
pub use domain::{DomainMatcher, DomainMatcherBuilder};
pub use ipset::{InvalidIpEntry, IpSet};
pub use pool::{BufferPool, PooledBuffer};
pub use proxy_protocol::{Command, Header, ProxyProtocolError, TransportProtocol, Version};
pub use relay::{relay, RelayStats};
pub use set::{check_access, AccessMode, StringSet};
pub use varint::WireError;
