//! SNI extraction from a TLS ClientHello.
//!
//! Reads one TLS record from the connection cache and parses the
//! ClientHello inside it:
//!
//! ```text
//! record:      u8 type (0x16) | u16 version | u16 length | handshake
//! handshake:   u8 type (0x01) | u24 length | u16 version | [32] random
//!              | u8 session id len | session id
//!              | u16 cipher suites len | cipher suites
//!              | u8 compression len | compression methods
//!              | u16 extensions len | extensions
//! extension:   u16 type | u16 length | data   (server_name is type 0)
//! server_name: u16 list len | { u8 name type | u16 len | name }*
//! ```

use std::time::Duration;

use async_trait::async_trait;
use craftgate_networking::{CachedStream, CACHE_CAPACITY};
use tokio::io::AsyncRead;

use super::{timed, ClientConn, Sniffer, SNIFF_STEP_TIMEOUT};
use crate::error::SniffError;
use crate::metadata::{Metadata, Protocol, TlsMetadata};

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

#[derive(Debug, Clone)]
pub struct TlsSniffer {
    step_timeout: Duration,
}

impl TlsSniffer {
    pub fn new(step_timeout: Duration) -> Self {
        Self { step_timeout }
    }
}

impl Default for TlsSniffer {
    fn default() -> Self {
        Self::new(SNIFF_STEP_TIMEOUT)
    }
}

#[async_trait]
impl Sniffer for TlsSniffer {
    async fn sniff(&self, conn: &mut ClientConn, metadata: &mut Metadata) -> Result<(), SniffError> {
        sniff_client_hello(conn, metadata, self.step_timeout).await
    }
}

/// Sniff a TLS ClientHello at the cursor of `conn`.
///
/// Sets `metadata.tls` when the bytes are a ClientHello, with the server
/// name if the client sent one.
pub async fn sniff_client_hello<S: AsyncRead + Unpin>(
    conn: &mut CachedStream<S>,
    metadata: &mut Metadata,
    step: Duration,
) -> Result<(), SniffError> {
    if metadata.tls.is_some() {
        return Ok(());
    }

    let header = timed(step, conn.peek(RECORD_HEADER_LEN)).await?;
    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniffError::BadPacket("not a TLS handshake record"));
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let room = CACHE_CAPACITY - conn.current_position().unwrap_or(0);
    if RECORD_HEADER_LEN + record_len > room {
        return Err(SniffError::BadPacket("TLS record does not fit the cache"));
    }

    let record = timed(step, conn.peek(RECORD_HEADER_LEN + record_len)).await?;
    let server_name = parse_client_hello(&record[RECORD_HEADER_LEN..])?;

    metadata.tls = Some(TlsMetadata { server_name });
    metadata.protocol = Some(Protocol::Tls);
    Ok(())
}

/// Parse a ClientHello handshake message and return its host name, if any.
fn parse_client_hello(handshake: &[u8]) -> Result<Option<String>, SniffError> {
    let mut reader = Reader(handshake);
    if reader.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(SniffError::BadPacket("not a ClientHello"));
    }
    let body_len = reader.u24()?;
    let mut hello = Reader(reader.take(body_len)?);

    hello.skip(2 + 32)?; // version, random
    let session_id_len = hello.u8()? as usize;
    hello.skip(session_id_len)?;
    let cipher_suites_len = hello.u16()? as usize;
    hello.skip(cipher_suites_len)?;
    let compression_len = hello.u8()? as usize;
    hello.skip(compression_len)?;

    if hello.is_empty() {
        return Ok(None);
    }
    let extensions_len = hello.u16()? as usize;
    let mut extensions = Reader(hello.take(extensions_len)?);

    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let data = extensions.take(ext_len)?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(data);
        }
    }
    Ok(None)
}

fn parse_server_name(data: &[u8]) -> Result<Option<String>, SniffError> {
    let mut reader = Reader(data);
    let list_len = reader.u16()? as usize;
    let mut list = Reader(reader.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        if name_type == NAME_TYPE_HOST {
            let name = std::str::from_utf8(name)
                .map_err(|_| SniffError::BadPacket("server name is not UTF-8"))?;
            return Ok(Some(name.to_ascii_lowercase().trim_end_matches('.').to_string()));
        }
    }
    Ok(None)
}

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SniffError> {
        if self.0.len() < n {
            return Err(SniffError::BadPacket("truncated ClientHello"));
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), SniffError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, SniffError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniffError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, SniffError> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    /// Build a TLS 1.2 ClientHello record, optionally carrying a server name.
    fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = server_name {
            let name = name.as_bytes();
            let entry_len = 3 + name.len();
            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&((2 + entry_len) as u16).to_be_bytes());
            extensions.extend_from_slice(&(entry_len as u16).to_be_bytes());
            extensions.push(NAME_TYPE_HOST);
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }
        // padding extension
        extensions.extend_from_slice(&[0x00, 0x15, 0x00, 0x04, 0, 0, 0, 0]);

        let mut hello = vec![0x03, 0x03];
        hello.extend_from_slice(&[0u8; 32]);
        hello.push(0); // session id
        hello.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]);
        hello.extend_from_slice(&[0x01, 0x00]);
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    async fn sniff(bytes: &[u8]) -> (Result<(), SniffError>, Metadata) {
        let (client, mut peer) = duplex(8192);
        peer.write_all(bytes).await.unwrap();
        drop(peer);
        let mut conn = CachedStream::new(client);
        let mut metadata = Metadata::new("test", "127.0.0.1:40000".parse().unwrap());
        let result = sniff_client_hello(&mut conn, &mut metadata, SNIFF_STEP_TIMEOUT).await;
        assert_eq!(conn.current_position(), Some(0));
        (result, metadata)
    }

    #[tokio::test]
    async fn test_server_name_found() {
        let (result, metadata) = sniff(&client_hello(Some("Example.COM."))).await;
        result.unwrap();
        assert_eq!(metadata.tls.unwrap().server_name.as_deref(), Some("example.com"));
        assert_eq!(metadata.protocol, Some(Protocol::Tls));
    }

    #[tokio::test]
    async fn test_client_hello_without_server_name() {
        let (result, metadata) = sniff(&client_hello(None)).await;
        result.unwrap();
        assert_eq!(metadata.tls, Some(TlsMetadata { server_name: None }));
    }

    #[tokio::test]
    async fn test_not_tls() {
        let (result, metadata) = sniff(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert!(matches!(result, Err(SniffError::BadPacket(_))));
        assert!(metadata.tls.is_none());
    }

    #[test]
    fn test_truncated_hello() {
        let record = client_hello(Some("example.com"));
        let handshake = &record[RECORD_HEADER_LEN..record.len() - 10];
        assert!(parse_client_hello(handshake).is_err());
        assert!(parse_client_hello(&[0x01, 0x00]).is_err());
    }

    #[test]
    fn test_not_client_hello() {
        let mut record = client_hello(Some("example.com"));
        record[RECORD_HEADER_LEN] = 0x02;
        assert!(matches!(
            parse_client_hello(&record[RECORD_HEADER_LEN..]),
            Err(SniffError::BadPacket("not a ClientHello"))
        ));
    }
}
