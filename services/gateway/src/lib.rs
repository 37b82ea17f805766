//! craftgate gateway.
//!
//! A TCP reverse proxy that understands enough of the Minecraft and TLS
//! handshakes to route by hostname, answer status pings locally, enforce
//! player access lists and forward the client address with PROXY headers.
//!
//! - [`config`]: CLI settings and the JSON configuration document
//! - [`metadata`]: per-connection metadata filled in by sniffers
//! - [`proxy`]: services, sniffers, rules, router and outbounds
//! - [`instance`]: start-up, reload and the config watch loop

pub mod config;
pub mod error;
pub mod instance;
pub mod metadata;
pub mod proxy;

pub use config::{Cli, Root};
pub use error::{ConfigError, OutboundError, ServiceError, SniffError};
pub use instance::Instance;
pub use metadata::{ConnectionId, Metadata};
