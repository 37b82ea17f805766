//! Per-connection metadata.
//!
//! A [`Metadata`] is created when a connection is accepted and is owned by
//! that connection's task. Sniffers fill in protocol sub-records, rules read
//! them and rewrites change the destination.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

use ulid::Ulid;
use uuid::Uuid;

/// Vendor marker Forge clients put after the hostname.
const FML_MARKER: &str = "FML";

/// Human-readable connection identifier, `conn_<ulid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Ulid::new().to_string().to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocols recognised by a sniffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Minecraft,
    Tls,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minecraft => "minecraft",
            Self::Tls => "tls",
        }
    }
}

/// SRV service override used by SRV-aware dialers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvMetadata {
    pub service_name: String,
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub id: ConnectionId,
    pub service_name: String,
    /// Last protocol a sniffer recognised.
    pub protocol: Option<Protocol>,
    pub source: SocketAddr,
    pub destination_hostname: String,
    pub destination_port: u16,
    pub srv: Option<SrvMetadata>,
    pub minecraft: Option<MinecraftMetadata>,
    pub tls: Option<TlsMetadata>,
    /// Free-form values for custom rule types.
    pub custom: HashMap<String, serde_json::Value>,
    sniffed: HashSet<String>,
}

impl Metadata {
    /// Metadata for a connection accepted from `source`.
    ///
    /// IPv4-mapped IPv6 sources are stored as IPv4.
    pub fn new(service_name: impl Into<String>, source: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            service_name: service_name.into(),
            protocol: None,
            source: unmap(source),
            destination_hostname: String::new(),
            destination_port: 0,
            srv: None,
            minecraft: None,
            tls: None,
            custom: HashMap::new(),
            sniffed: HashSet::new(),
        }
    }

    /// Set the default destination.
    pub fn with_destination(mut self, hostname: impl Into<String>, port: u16) -> Self {
        self.destination_hostname = hostname.into();
        self.destination_port = port;
        self
    }

    /// Record that `protocol` was sniffed. Returns false if it already was.
    pub fn mark_sniffed(&mut self, protocol: &str) -> bool {
        self.sniffed.insert(protocol.to_string())
    }

    pub fn was_sniffed(&self, protocol: &str) -> bool {
        self.sniffed.contains(protocol)
    }

    /// Whether a destination is set that a dialer can use.
    pub fn has_destination(&self) -> bool {
        !self.destination_hostname.is_empty() && self.destination_port != 0
    }

    /// `host:port` of the current destination, bracketing IPv6 literals.
    pub fn destination_address(&self) -> String {
        join_host_port(&self.destination_hostname, self.destination_port)
    }

    pub fn set_source(&mut self, source: SocketAddr) {
        self.source = unmap(source);
    }
}

/// Next state requested by the Minecraft handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status = 1,
    Login = 2,
    Transfer = 3,
}

impl NextState {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Status),
            2 => Some(Self::Login),
            3 => Some(Self::Transfer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinecraftMetadata {
    pub protocol_version: u32,
    /// Hostname as sent, including any vendor suffix after a NUL.
    pub origin_destination: String,
    pub origin_port: u16,
    pub rewritten_destination: Option<String>,
    pub rewritten_port: Option<u16>,
    pub player_name: String,
    /// Zero when the client did not send one.
    pub uuid: Uuid,
    pub next_state: NextState,
    /// Cache offset just past the handshake packet.
    pub sniff_position: Option<usize>,
}

impl MinecraftMetadata {
    /// Hostname without the vendor suffix.
    pub fn clean_origin_destination(&self) -> &str {
        match self.origin_destination.split_once('\0') {
            Some((host, _)) => host,
            None => &self.origin_destination,
        }
    }

    /// Vendor suffix after the first NUL, if any.
    pub fn fml_markup(&self) -> Option<&str> {
        self.origin_destination.split_once('\0').map(|(_, markup)| markup)
    }

    /// Whether the client is a Forge client.
    pub fn is_fml(&self) -> bool {
        self.fml_markup()
            .is_some_and(|markup| markup.contains(FML_MARKER))
    }

    /// Rewritten hostname, or the clean origin.
    pub fn destination(&self) -> &str {
        self.rewritten_destination
            .as_deref()
            .unwrap_or_else(|| self.clean_origin_destination())
    }

    /// Rewritten port, or the origin port.
    pub fn port(&self) -> u16 {
        self.rewritten_port.unwrap_or(self.origin_port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMetadata {
    /// Server name from the ClientHello, lower-cased.
    pub server_name: Option<String>,
}

/// Format `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn unmap(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}
