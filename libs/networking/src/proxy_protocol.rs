//! PROXY protocol v1/v2 header encoding and decoding.
//!
//! Headers are written to upstream connections so the backend sees the
//! original client address, and read from inbound connections when a
//! load balancer in front of us does the same.
//!
//! Wire format v1 (text):
//! - `PROXY TCP4|TCP6 <src> <dst> <sport> <dport>\r\n`
//! - `PROXY UNKNOWN\r\n`
//!
//! Wire format v2 (binary):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length
//! - variable: addresses and ports, then TLVs (skipped when reading)
//!
//! Reference: https://www.haproxy.org/download/1.8/doc/proxy-protocol.txt

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::cached::CachedStream;

/// PROXY protocol v1 prefix.
const PROXY_V1_PREFIX: &[u8; 6] = b"PROXY ";

/// PROXY protocol v2 signature (12 bytes).
pub const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version nibble of the v2 version/command byte.
const VERSION_2: u8 = 0x20;

const MASK_VERSION: u8 = 0xF0;
const MASK_COMMAND: u8 = 0x0F;

/// Address family: unspecified.
pub const AF_UNSPEC: u8 = 0x00;

/// Address family: AF_INET (IPv4).
pub const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
pub const AF_INET6: u8 = 0x20;

/// Address family: AF_UNIX.
pub const AF_UNIX: u8 = 0x30;

/// Transport protocol: STREAM (TCP).
pub const TRANSPORT_STREAM: u8 = 0x01;

/// Transport protocol: DGRAM (UDP).
pub const TRANSPORT_DGRAM: u8 = 0x02;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Deadline applied to every read step while decoding a header.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// PROXY protocol errors.
#[derive(Debug, Error)]
pub enum ProxyProtocolError {
    /// Stream does not start with a PROXY header. Not fatal: rewind and carry on.
    #[error("not PROXY protocol")]
    NotProxyProtocol,

    /// Header started but could not be parsed.
    #[error("malformed PROXY header: {0}")]
    Malformed(String),

    /// Valid header this implementation does not handle.
    #[error("unsupported PROXY header: {0}")]
    Unsupported(String),

    /// Address does not belong to the declared family.
    #[error("address family mismatch: {0}")]
    FamilyMismatch(String),

    /// I/O error, including read deadlines.
    #[error("PROXY header I/O: {0}")]
    Io(#[from] io::Error),
}

/// Header version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

impl Version {
    /// Map a configured version number (1 or 2).
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

/// Header command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Connection made by the proxy itself (health checks); addresses carry no meaning.
    Local,
    /// Connection relayed on behalf of a client.
    Proxy,
}

/// Address family (high nibble) and transport (low nibble) byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportProtocol(u8);

impl TransportProtocol {
    pub const UNSPEC: Self = Self(AF_UNSPEC);
    pub const TCP4: Self = Self(AF_INET | TRANSPORT_STREAM);
    pub const UDP4: Self = Self(AF_INET | TRANSPORT_DGRAM);
    pub const TCP6: Self = Self(AF_INET6 | TRANSPORT_STREAM);
    pub const UDP6: Self = Self(AF_INET6 | TRANSPORT_DGRAM);

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Address family nibble (`AF_*`).
    pub fn family(self) -> u8 {
        self.0 & 0xF0
    }

    /// Transport nibble (`TRANSPORT_*`).
    pub fn transport(self) -> u8 {
        self.0 & 0x0F
    }

    pub fn is_unspec(self) -> bool {
        self.family() == AF_UNSPEC
    }

    /// Stream transport for the family of `ip` (after unmapping).
    pub fn stream_for(ip: IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(_) => Self::TCP4,
            IpAddr::V6(_) => Self::TCP6,
        }
    }
}

/// A PROXY protocol header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: Version,
    pub command: Command,
    pub transport: TransportProtocol,
    /// Original client address; `None` for LOCAL and UNKNOWN headers.
    pub source: Option<SocketAddr>,
}

impl Header {
    /// Header announcing `source` as the client of a TCP connection.
    pub fn proxy(version: Version, source: SocketAddr) -> Self {
        let source = unmap(source);
        Self {
            version,
            command: Command::Proxy,
            transport: TransportProtocol::stream_for(source.ip()),
            source: Some(source),
        }
    }

    /// v2 LOCAL header.
    pub fn local() -> Self {
        Self {
            version: Version::V2,
            command: Command::Local,
            transport: TransportProtocol::UNSPEC,
            source: None,
        }
    }

    /// Encode the header. `destination` defaults to the unspecified address of the family.
    ///
    /// Fails before producing any bytes if the addresses do not fit the
    /// declared family or the family is not supported.
    pub fn encode(&self, destination: Option<SocketAddr>) -> Result<Vec<u8>, ProxyProtocolError> {
        match self.version {
            Version::V1 => self.encode_v1(destination),
            Version::V2 => self.encode_v2(destination),
        }
    }

    /// Encode and write the header in one `write_all`.
    pub async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        destination: Option<SocketAddr>,
    ) -> Result<(), ProxyProtocolError> {
        let bytes = self.encode(destination)?;
        tokio::io::AsyncWriteExt::write_all(writer, &bytes).await?;
        Ok(())
    }

    /// Encode the text (v1) form.
    fn encode_v1(&self, destination: Option<SocketAddr>) -> Result<Vec<u8>, ProxyProtocolError> {
        let mut buf = Vec::with_capacity(108); // longest v1 header + CRLF

        buf.write_all(PROXY_V1_PREFIX)?;

        let is_ipv4 = match self.transport.family() {
            AF_INET => true,
            AF_INET6 => false,
            AF_UNSPEC => {
                buf.write_all(b"UNKNOWN\r\n")?;
                return Ok(buf);
            }
            other => {
                return Err(ProxyProtocolError::Unsupported(format!(
                    "address family {other:#04x} in v1 header"
                )))
            }
        };

        let source = unmap(self.require_source()?);
        let destination = destination
            .map(unmap)
            .unwrap_or_else(|| unspecified(is_ipv4));
        if source.is_ipv4() != is_ipv4 || destination.is_ipv4() != is_ipv4 {
            return Err(ProxyProtocolError::FamilyMismatch(format!(
                "{source} -> {destination} under {}",
                if is_ipv4 { "TCP4" } else { "TCP6" }
            )));
        }

        buf.write_all(if is_ipv4 { b"TCP4 " } else { b"TCP6 " })?;
        write!(
            buf,
            "{} {} {} {}\r\n",
            source.ip(),
            destination.ip(),
            source.port(),
            destination.port()
        )?;

        Ok(buf)
    }

    /// Encode the binary (v2) form.
    fn encode_v2(&self, destination: Option<SocketAddr>) -> Result<Vec<u8>, ProxyProtocolError> {
        let mut buf = Vec::with_capacity(16 + 36); // header + largest address block

        // Signature (12 bytes)
        buf.write_all(&PROXY_V2_SIGNATURE)?;

        // Version and command
        let command = match self.command {
            Command::Local => 0x0,
            Command::Proxy => 0x1,
        };
        buf.push(VERSION_2 | command);

        // Address family and protocol
        buf.push(self.transport.as_byte());

        if self.command == Command::Local {
            buf.write_all(&0u16.to_be_bytes())?;
            return Ok(buf);
        }

        match self.transport.family() {
            AF_INET => {
                let source = self.require_source()?;
                let src_ip = match source.ip() {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(ip) => {
                        return Err(ProxyProtocolError::FamilyMismatch(format!(
                            "invalid IPv4 source address: {ip}"
                        )))
                    }
                };
                let destination = destination.map(unmap).unwrap_or_else(|| unspecified(true));
                let dst_ip = match destination.ip() {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(ip) => {
                        return Err(ProxyProtocolError::FamilyMismatch(format!(
                            "invalid IPv4 destination address: {ip}"
                        )))
                    }
                };

                buf.write_all(&IPV4_ADDR_LEN.to_be_bytes())?;
                buf.write_all(&src_ip.octets())?;
                buf.write_all(&dst_ip.octets())?;
                buf.write_all(&source.port().to_be_bytes())?;
                buf.write_all(&destination.port().to_be_bytes())?;
            }
            AF_INET6 => {
                let source = self.require_source()?;
                let src_ip = match source.ip() {
                    IpAddr::V6(ip) => ip,
                    IpAddr::V4(ip) => {
                        return Err(ProxyProtocolError::FamilyMismatch(format!(
                            "invalid IPv6 source address: {ip}"
                        )))
                    }
                };
                let destination = destination.unwrap_or_else(|| unspecified(false));
                let dst_ip = match destination.ip() {
                    IpAddr::V6(ip) => ip,
                    IpAddr::V4(ip) => {
                        return Err(ProxyProtocolError::FamilyMismatch(format!(
                            "invalid IPv6 destination address: {ip}"
                        )))
                    }
                };

                buf.write_all(&IPV6_ADDR_LEN.to_be_bytes())?;
                buf.write_all(&src_ip.octets())?;
                buf.write_all(&dst_ip.octets())?;
                buf.write_all(&source.port().to_be_bytes())?;
                buf.write_all(&destination.port().to_be_bytes())?;
            }
            AF_UNIX => {
                return Err(ProxyProtocolError::Unsupported(
                    "unix socket transport".to_string(),
                ))
            }
            other => {
                return Err(ProxyProtocolError::Unsupported(format!(
                    "address family {other:#04x}"
                )))
            }
        }

        Ok(buf)
    }

    fn require_source(&self) -> Result<SocketAddr, ProxyProtocolError> {
        self.source.ok_or_else(|| {
            ProxyProtocolError::Malformed("PROXY command without source address".to_string())
        })
    }
}

/// Read a PROXY header from the front of `stream`.
///
/// Every read step is bounded by `step_timeout`. Returns
/// [`ProxyProtocolError::NotProxyProtocol`] without consuming anything when
/// the stream does not start with either signature.
pub async fn read_header<S: AsyncRead + Unpin>(
    stream: &mut CachedStream<S>,
    step_timeout: Duration,
) -> Result<Header, ProxyProtocolError> {
    let identity: [u8; 6] = copy_array(timed(step_timeout, stream.peek(6)).await?);

    if &identity == PROXY_V1_PREFIX {
        stream.consume(6);
        return read_v1(stream, step_timeout).await;
    }

    if identity[..] == PROXY_V2_SIGNATURE[..6] {
        let signature: [u8; 12] = copy_array(timed(step_timeout, stream.peek(12)).await?);
        if signature == PROXY_V2_SIGNATURE {
            stream.consume(12);
            return read_v2(stream, step_timeout).await;
        }
    }

    Err(ProxyProtocolError::NotProxyProtocol)
}

async fn read_v1<S: AsyncRead + Unpin>(
    stream: &mut CachedStream<S>,
    step_timeout: Duration,
) -> Result<Header, ProxyProtocolError> {
    const SPACE: &[u8] = b" ";
    const CRLF: &[u8] = b"\r\n";

    let mut header = Header {
        version: Version::V1,
        command: Command::Proxy,
        transport: TransportProtocol::UNSPEC,
        source: None,
    };

    let (protocol, delimiter) = {
        let (token, delimiter) = timed(step_timeout, stream.peek_until(&[SPACE, CRLF])).await?;
        (token.to_vec(), delimiter)
    };
    match protocol.as_slice() {
        b"TCP4" => header.transport = TransportProtocol::TCP4,
        b"TCP6" => header.transport = TransportProtocol::TCP6,
        b"UNKNOWN" => {
            if delimiter == 1 {
                return Ok(header);
            }
        }
        other => {
            return Err(ProxyProtocolError::Malformed(format!(
                "unrecognized v1 protocol {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    }

    let source_ip: IpAddr = v1_token(stream, SPACE, step_timeout)
        .await?
        .parse()
        .map_err(|e| ProxyProtocolError::Malformed(format!("v1 source address: {e}")))?;
    v1_token(stream, SPACE, step_timeout).await?; // destination address
    let source_port: u16 = v1_token(stream, SPACE, step_timeout)
        .await?
        .parse()
        .map_err(|e| ProxyProtocolError::Malformed(format!("v1 source port: {e}")))?;
    v1_token(stream, CRLF, step_timeout).await?; // destination port

    // UNKNOWN addresses are informational only.
    if !header.transport.is_unspec() {
        header.source = Some(SocketAddr::new(source_ip.to_canonical(), source_port));
    }
    Ok(header)
}

async fn v1_token<S: AsyncRead + Unpin>(
    stream: &mut CachedStream<S>,
    delimiter: &[u8],
    step_timeout: Duration,
) -> Result<String, ProxyProtocolError> {
    let (token, _) = timed(step_timeout, stream.peek_until(&[delimiter])).await?;
    Ok(String::from_utf8_lossy(token).into_owned())
}

async fn read_v2<S: AsyncRead + Unpin>(
    stream: &mut CachedStream<S>,
    step_timeout: Duration,
) -> Result<Header, ProxyProtocolError> {
    let [version_command, family_protocol, len_hi, len_lo]: [u8; 4] =
        copy_array(timed(step_timeout, stream.peek(4)).await?);
    stream.consume(4);

    if version_command & MASK_VERSION != VERSION_2 {
        return Err(ProxyProtocolError::Malformed(format!(
            "v2 version mismatch: {:#04x}",
            version_command & MASK_VERSION
        )));
    }
    let command = match version_command & MASK_COMMAND {
        0x0 => Command::Local,
        0x1 => Command::Proxy,
        other => {
            return Err(ProxyProtocolError::Malformed(format!(
                "bad v2 command: {other:#04x}"
            )))
        }
    };

    let transport = TransportProtocol::from_byte(family_protocol);
    let rest_len = usize::from(u16::from_be_bytes([len_hi, len_lo]));
    let rest = timed(step_timeout, stream.peek(rest_len)).await?.to_vec();
    stream.consume(rest_len);

    let mut header = Header {
        version: Version::V2,
        command,
        transport,
        source: None,
    };
    if command == Command::Local {
        return Ok(header);
    }

    header.source = match transport.family() {
        AF_INET => {
            if rest.len() < usize::from(IPV4_ADDR_LEN) {
                return Err(ProxyProtocolError::Malformed(
                    "v2 IPv4 address block truncated".to_string(),
                ));
            }
            let src_ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let src_port = u16::from_be_bytes([rest[8], rest[9]]);
            Some(SocketAddr::new(IpAddr::V4(src_ip), src_port))
        }
        AF_INET6 => {
            if rest.len() < usize::from(IPV6_ADDR_LEN) {
                return Err(ProxyProtocolError::Malformed(
                    "v2 IPv6 address block truncated".to_string(),
                ));
            }
            let src_octets: [u8; 16] = copy_array(&rest[..16]);
            let src_ip = Ipv6Addr::from(src_octets);
            let src_port = u16::from_be_bytes([rest[32], rest[33]]);
            Some(SocketAddr::new(IpAddr::V6(src_ip).to_canonical(), src_port))
        }
        AF_UNIX => {
            return Err(ProxyProtocolError::Unsupported(
                "unix socket transport".to_string(),
            ))
        }
        AF_UNSPEC => None,
        other => {
            return Err(ProxyProtocolError::Malformed(format!(
                "unrecognized address family {other:#04x}"
            )))
        }
    };

    Ok(header)
}

/// Run one read step under a deadline.
async fn timed<T>(
    step_timeout: Duration,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> Result<T, ProxyProtocolError> {
    match timeout(step_timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProxyProtocolError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "PROXY header read timed out",
        ))),
    }
}

/// Copy the first `N` bytes of a slice the caller has already sized.
fn copy_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn unmap(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

fn unspecified(ipv4: bool) -> SocketAddr {
    if ipv4 {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    }
}
