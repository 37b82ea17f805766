//! Dialing outbound: connect through a dialer and optionally announce the
//! client with a PROXY header.

use std::sync::Arc;

use async_trait::async_trait;
use craftgate_networking::{Header, Version};
use tokio::net::TcpStream;
use tracing::debug;

use super::{dial_for, Capabilities, Dialer};
use crate::error::OutboundError;
use crate::metadata::Metadata;

pub struct PlainOutbound {
    name: String,
    via: Arc<dyn Dialer>,
    proxy_protocol: Option<Version>,
    target: Option<(String, u16)>,
}

impl PlainOutbound {
    pub fn new(name: impl Into<String>, via: Arc<dyn Dialer>) -> Self {
        Self {
            name: name.into(),
            via,
            proxy_protocol: None,
            target: None,
        }
    }

    /// Write a PROXY header of `version` after connecting.
    pub fn with_proxy_protocol(mut self, version: Option<Version>) -> Self {
        self.proxy_protocol = version;
        self
    }

    /// Destination used when the connection has none of its own.
    pub fn with_target(mut self, address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        self.target = (!address.is_empty() && port != 0).then_some((address, port));
        self
    }

    pub fn fill_destination(&self, metadata: &mut Metadata) {
        if let Some((address, port)) = &self.target {
            if metadata.destination_hostname.is_empty() {
                metadata.destination_hostname = address.clone();
            }
            if metadata.destination_port == 0 {
                metadata.destination_port = *port;
            }
        }
    }
}

#[async_trait]
impl Dialer for PlainOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            metadata_dial: true,
            ..Capabilities::default()
        }
    }

    async fn dial(&self, address: &str) -> Result<TcpStream, OutboundError> {
        self.via.dial(address).await
    }

    async fn dial_with_metadata(
        &self,
        address: &str,
        metadata: &Metadata,
    ) -> Result<TcpStream, OutboundError> {
        let mut stream = dial_for(self.via.as_ref(), address, metadata).await?;
        if let Some(version) = self.proxy_protocol {
            write_proxy_header(&mut stream, version, metadata).await?;
            debug!(id = %metadata.id, outbound = %self.name, ?version, "Wrote PROXY header");
        }
        Ok(stream)
    }
}

/// Announce `metadata.source` to the upstream, with the dialed socket's
/// local address as the destination.
pub(crate) async fn write_proxy_header(
    stream: &mut TcpStream,
    version: Version,
    metadata: &Metadata,
) -> Result<(), OutboundError> {
    let local = stream.local_addr()?;
    Header::proxy(version, metadata.source)
        .write_to(stream, Some(local))
        .await?;
    Ok(())
}
