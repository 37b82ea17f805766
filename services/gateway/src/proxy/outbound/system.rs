//! Direct TCP dialing with an optional SRV lookup.
//!
//! One [`SystemDialer`] is built per instance and handed to every outbound
//! that does not dial through another outbound.

use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Capabilities, Dialer};
use crate::error::OutboundError;
use crate::metadata::{join_host_port, SrvMetadata};

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SystemDialer {
    connect_timeout: Duration,
    resolver: Resolver<TokioConnectionProvider>,
}

impl SystemDialer {
    /// Dialer using the host's resolver configuration, or public defaults
    /// when it cannot be read.
    pub fn new(connect_timeout: Duration) -> Self {
        let (config, opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                warn!(error = %e, "Failed to read system resolver configuration, using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();
        Self {
            connect_timeout,
            resolver,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    async fn connect(&self, address: &str) -> Result<TcpStream, OutboundError> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                // Relayed game traffic is latency-sensitive.
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(OutboundError::Dial {
                address: address.to_string(),
                source,
            }),
            Err(_) => Err(OutboundError::DialTimeout {
                address: address.to_string(),
            }),
        }
    }

    /// SRV targets for `_<service>._tcp.<host>`, best first.
    async fn srv_targets(&self, service: &str, host: &str) -> Vec<String> {
        let name = format!("_{service}._tcp.{host}");
        let lookup = match self.resolver.srv_lookup(name.as_str()).await {
            Ok(lookup) => lookup,
            Err(e) => {
                debug!(name = %name, error = %e, "SRV lookup returned nothing");
                return Vec::new();
            }
        };

        let mut records: Vec<_> = lookup.iter().collect();
        records.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| b.weight().cmp(&a.weight()))
        });
        records
            .into_iter()
            .map(|srv| {
                let target = srv.target().to_utf8();
                join_host_port(target.trim_end_matches('.'), srv.port())
            })
            .collect()
    }
}

impl Default for SystemDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl std::fmt::Debug for SystemDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemDialer")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dialer for SystemDialer {
    fn name(&self) -> &str {
        "system"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            srv_dial: true,
            ..Capabilities::default()
        }
    }

    async fn dial(&self, address: &str) -> Result<TcpStream, OutboundError> {
        self.connect(address).await
    }

    /// Try each SRV target in order, then the literal address.
    async fn dial_srv(&self, address: &str, srv: &SrvMetadata) -> Result<TcpStream, OutboundError> {
        let host = split_host(address);
        if host.parse::<std::net::IpAddr>().is_err() {
            for target in self.srv_targets(&srv.service_name, host).await {
                match self.connect(&target).await {
                    Ok(stream) => {
                        debug!(address, target = %target, "Dialed SRV target");
                        return Ok(stream);
                    }
                    Err(e) => debug!(target = %target, error = %e, "SRV target failed"),
                }
            }
        }
        self.connect(address).await
    }
}

/// Host part of `host:port`, without IPv6 brackets.
fn split_host(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_split_host() {
        assert_eq!(split_host("mc.example.com:25565"), "mc.example.com");
        assert_eq!(split_host("[::1]:25565"), "::1");
        assert_eq!(split_host("mc.example.com"), "mc.example.com");
    }

    #[tokio::test]
    async fn test_dial_literal_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let dialer = SystemDialer::new(Duration::from_secs(1));
        let stream = dialer.dial(&address).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), listener.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_srv_dial_ip_literal_skips_lookup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let dialer = SystemDialer::new(Duration::from_secs(1));
        let srv = SrvMetadata {
            service_name: "minecraft".to_string(),
        };
        assert!(dialer.dial_srv(&address, &srv).await.is_ok());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dialer = SystemDialer::new(Duration::from_secs(1));
        let err = dialer.dial(&address).await.unwrap_err();
        assert!(matches!(err, OutboundError::Dial { .. }));
    }
}
