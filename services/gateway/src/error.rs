//! Error types for the gateway.

use std::io;
use std::net::SocketAddr;

use craftgate_networking::{InvalidIpEntry, ProxyProtocolError, WireError};
use thiserror::Error;

/// Problems found while building a router or service from configuration.
///
/// These are raised before any live state is replaced, so a reload that
/// hits one leaves the running configuration untouched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown rule type: {0}")]
    UnknownRuleType(String),

    #[error("unknown sniffer: {0}")]
    UnknownSniffer(String),

    #[error("list not found: {0}")]
    ListNotFound(String),

    #[error("outbound not found: {0}")]
    OutboundNotFound(String),

    #[error("duplicate outbound name: {0}")]
    DuplicateOutbound(String),

    #[error("outbound dialer cycle through: {0}")]
    DialerCycle(String),

    #[error("unknown PROXY protocol version: {0}")]
    InvalidProxyVersion(u8),

    #[error("rule {rule_type}: invalid parameter: {reason}")]
    InvalidParameter { rule_type: String, reason: String },

    #[error("invalid MOTD sample: {0}")]
    InvalidSample(String),

    #[error(transparent)]
    InvalidIp(#[from] InvalidIpEntry),
}

impl ConfigError {
    pub(crate) fn parameter(rule_type: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidParameter {
            rule_type: rule_type.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A sniffer could not recognise its protocol in the buffered bytes.
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("bad packet: {0}")]
    BadPacket(&'static str),

    #[error("sniff i/o: {0}")]
    Io(#[from] io::Error),
}

impl SniffError {
    /// Whether the sniff step ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }
}

impl From<WireError> for SniffError {
    fn from(e: WireError) -> Self {
        Self::BadPacket(match e {
            WireError::VarIntTooBig => "varint too big",
            WireError::UnexpectedEnd => "truncated field",
            WireError::NegativeLength(_) => "negative length",
            WireError::StringTooLong { .. } => "string too long",
            WireError::InvalidUtf8 => "invalid utf-8",
        })
    }
}

/// Failures while an outbound dials or serves a connection.
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("dial {address}: timed out")]
    DialTimeout { address: String },

    #[error("outbound {0} cannot dial, it only accepts injected connections")]
    InjectionRequired(String),

    #[error("outbound {0} does not accept injected connections")]
    InjectionUnsupported(String),

    #[error("missing Minecraft metadata")]
    MissingMinecraftMetadata,

    #[error("rejected by {0}")]
    Rejected(&'static str),

    #[error(transparent)]
    ProxyProtocol(#[from] ProxyProtocolError),

    #[error(transparent)]
    Sniff(#[from] SniffError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A service could not be started.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service {service}: bind {address}: {source}")]
    Bind {
        service: String,
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("service {service}: {source}")]
    Config {
        service: String,
        #[source]
        source: ConfigError,
    },
}
