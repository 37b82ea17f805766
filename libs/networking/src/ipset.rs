//! Compiled set of IP addresses and CIDR prefixes.

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// Entry that is neither an IP address nor a CIDR prefix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bad IP address or CIDR [{0}]")]
pub struct InvalidIpEntry(pub String);

/// Immutable set of networks, aggregated at build time.
#[derive(Debug, Clone, Default)]
pub struct IpSet {
    networks: Vec<IpNet>,
}

impl IpSet {
    /// Build a set from literal addresses (`10.0.0.1`) and prefixes (`10.0.0.0/8`).
    pub fn from_entries<I, S>(entries: I) -> Result<Self, InvalidIpEntry>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut networks = Vec::new();
        for entry in entries {
            networks.push(parse_entry(entry.as_ref())?);
        }
        Ok(Self {
            networks: IpNet::aggregate(&networks),
        })
    }

    /// Whether `ip` falls in any network of the set.
    ///
    /// IPv4-mapped IPv6 addresses are checked as IPv4.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.networks.iter().any(|network| network.contains(&ip))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Aggregated networks in the set.
    #[must_use]
    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }
}

fn parse_entry(entry: &str) -> Result<IpNet, InvalidIpEntry> {
    let entry = entry.trim();
    if entry.contains('/') {
        entry
            .parse::<IpNet>()
            .map(|network| network.trunc())
            .map_err(|_| InvalidIpEntry(entry.to_string()))
    } else {
        entry
            .parse::<IpAddr>()
            .map(|ip| IpNet::from(ip.to_canonical()))
            .map_err(|_| InvalidIpEntry(entry.to_string()))
    }
}
