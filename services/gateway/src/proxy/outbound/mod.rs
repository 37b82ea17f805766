//! Outbounds: where a routed connection goes.
//!
//! An outbound either dials a new upstream connection (plain outbounds and
//! the system dialer) or takes over the client connection itself (Minecraft
//! outbounds and the built-in `REJECT` / `RESET`). Which of the two, and
//! which dialing variants are supported, is fixed at construction and
//! exposed as [`Capabilities`].

pub mod builtin;
pub mod minecraft;
pub mod motd;
pub mod plain;
pub mod system;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use craftgate_networking::{BufferPool, Version};
use tokio::net::TcpStream;

use crate::config::OutboundConfig;
use crate::error::{ConfigError, OutboundError};
use crate::metadata::{Metadata, SrvMetadata};
use crate::proxy::rules::ListMap;
use crate::proxy::sniff::ClientConn;

pub use minecraft::MinecraftOutbound;
pub use plain::PlainOutbound;
pub use system::SystemDialer;

/// Name of the outbound used when no rule selects one and none is configured.
pub const DEFAULT_OUTBOUND: &str = "default";

/// What an outbound supports beyond plain dialing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Takes over the client connection instead of dialing.
    pub inject: bool,
    /// Dials with the full connection metadata.
    pub metadata_dial: bool,
    /// Resolves SRV records before dialing.
    pub srv_dial: bool,
}

#[async_trait]
pub trait Dialer: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn dial(&self, address: &str) -> Result<TcpStream, OutboundError>;

    async fn dial_with_metadata(
        &self,
        address: &str,
        _metadata: &Metadata,
    ) -> Result<TcpStream, OutboundError> {
        self.dial(address).await
    }

    async fn dial_srv(&self, address: &str, _srv: &SrvMetadata) -> Result<TcpStream, OutboundError> {
        self.dial(address).await
    }
}

/// Dial `address` with the richest variant `dialer` supports.
///
/// Metadata-aware dialing wins; otherwise an SRV service on the metadata is
/// honoured by SRV-aware dialers.
pub async fn dial_for(
    dialer: &dyn Dialer,
    address: &str,
    metadata: &Metadata,
) -> Result<TcpStream, OutboundError> {
    let capabilities = dialer.capabilities();
    if capabilities.metadata_dial {
        return dialer.dial_with_metadata(address, metadata).await;
    }
    match &metadata.srv {
        Some(srv) if capabilities.srv_dial => dialer.dial_srv(address, srv).await,
        _ => dialer.dial(address).await,
    }
}

pub enum OutboundKind {
    Plain(PlainOutbound),
    Minecraft(MinecraftOutbound),
    Reject,
    Reset,
}

/// A named outbound as the router sees it.
pub struct Outbound {
    name: String,
    kind: OutboundKind,
}

impl Outbound {
    pub fn new(name: impl Into<String>, kind: OutboundKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn reject() -> Self {
        Self::new(builtin::REJECT, OutboundKind::Reject)
    }

    pub fn reset() -> Self {
        Self::new(builtin::RESET, OutboundKind::Reset)
    }

    pub fn kind(&self) -> &OutboundKind {
        &self.kind
    }

    /// Give a dialing outbound the chance to supply a missing destination.
    pub fn fill_destination(&self, metadata: &mut Metadata) {
        if let OutboundKind::Plain(plain) = &self.kind {
            plain.fill_destination(metadata);
        }
    }

    /// Take over `conn`.
    pub async fn inject(&self, conn: &mut ClientConn, metadata: &mut Metadata) -> Result<(), OutboundError> {
        match &self.kind {
            OutboundKind::Minecraft(minecraft) => minecraft.inject(conn, metadata).await,
            OutboundKind::Reject => Ok(builtin::reject(conn).await?),
            OutboundKind::Reset => Ok(builtin::reset(conn)?),
            OutboundKind::Plain(_) => Err(OutboundError::InjectionUnsupported(self.name.clone())),
        }
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            OutboundKind::Plain(_) => "plain",
            OutboundKind::Minecraft(_) => "minecraft",
            OutboundKind::Reject => "reject",
            OutboundKind::Reset => "reset",
        };
        f.debug_struct("Outbound")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

#[async_trait]
impl Dialer for Outbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        match &self.kind {
            OutboundKind::Plain(plain) => plain.capabilities(),
            OutboundKind::Minecraft(_) | OutboundKind::Reject | OutboundKind::Reset => Capabilities {
                inject: true,
                ..Capabilities::default()
            },
        }
    }

    async fn dial(&self, address: &str) -> Result<TcpStream, OutboundError> {
        match &self.kind {
            OutboundKind::Plain(plain) => plain.dial(address).await,
            _ => Err(OutboundError::InjectionRequired(self.name.clone())),
        }
    }

    async fn dial_with_metadata(
        &self,
        address: &str,
        metadata: &Metadata,
    ) -> Result<TcpStream, OutboundError> {
        match &self.kind {
            OutboundKind::Plain(plain) => plain.dial_with_metadata(address, metadata).await,
            _ => Err(OutboundError::InjectionRequired(self.name.clone())),
        }
    }
}

/// Outbounds by name.
pub type OutboundMap = HashMap<String, Arc<Outbound>>;

/// Shared dependencies for building outbounds.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub lists: &'a ListMap,
    pub system: &'a Arc<SystemDialer>,
    pub pool: &'a Arc<BufferPool>,
    /// Outbounds of the configuration being replaced, for carrying player counts over.
    pub previous: Option<&'a OutboundMap>,
}

/// Build every configured outbound, dialers before the outbounds that use them.
pub fn build_outbounds(
    configs: &[OutboundConfig],
    ctx: BuildContext<'_>,
) -> Result<OutboundMap, ConfigError> {
    let mut by_name = HashMap::with_capacity(configs.len());
    for config in configs {
        if builtin::is_reserved(&config.name) || by_name.insert(config.name.as_str(), config).is_some() {
            return Err(ConfigError::DuplicateOutbound(config.name.clone()));
        }
    }

    let mut builder = Builder {
        configs: by_name,
        ctx,
        built: OutboundMap::with_capacity(configs.len()),
        visiting: HashSet::new(),
    };
    for config in configs {
        builder.build(&config.name)?;
    }
    Ok(builder.built)
}

/// A plain outbound dialing directly, used when no default is configured.
pub fn default_outbound(system: &Arc<SystemDialer>) -> Outbound {
    let via: Arc<dyn Dialer> = system.clone();
    Outbound::new(
        DEFAULT_OUTBOUND,
        OutboundKind::Plain(PlainOutbound::new(DEFAULT_OUTBOUND, via)),
    )
}

struct Builder<'a> {
    configs: HashMap<&'a str, &'a OutboundConfig>,
    ctx: BuildContext<'a>,
    built: OutboundMap,
    visiting: HashSet<String>,
}

impl Builder<'_> {
    fn build(&mut self, name: &str) -> Result<Arc<Outbound>, ConfigError> {
        if let Some(outbound) = self.built.get(name) {
            return Ok(outbound.clone());
        }
        match name {
            builtin::REJECT => return Ok(Arc::new(Outbound::reject())),
            builtin::RESET => return Ok(Arc::new(Outbound::reset())),
            _ => {}
        }
        let config = *self
            .configs
            .get(name)
            .ok_or_else(|| ConfigError::OutboundNotFound(name.to_string()))?;
        if !self.visiting.insert(name.to_string()) {
            return Err(ConfigError::DialerCycle(name.to_string()));
        }

        let via: Arc<dyn Dialer> = match config.dialer.as_deref() {
            Some(dialer) if !dialer.is_empty() => self.build(dialer)? as Arc<dyn Dialer>,
            _ => self.ctx.system.clone() as Arc<dyn Dialer>,
        };
        let proxy_protocol = match config.proxy_protocol_version {
            0 => None,
            n => Some(Version::from_number(n).ok_or(ConfigError::InvalidProxyVersion(n))?),
        };

        let kind = match &config.minecraft {
            Some(options) => {
                let mut minecraft = MinecraftOutbound::new(
                    &config.name,
                    options.clone(),
                    &config.target_address,
                    config.target_port,
                    self.ctx.lists,
                    via,
                    self.ctx.pool.clone(),
                )?
                .with_proxy_protocol(proxy_protocol);
                if let Some(counter) = self.previous_counter(name) {
                    minecraft = minecraft.with_online_counter(counter);
                }
                OutboundKind::Minecraft(minecraft)
            }
            None => OutboundKind::Plain(
                PlainOutbound::new(&config.name, via)
                    .with_proxy_protocol(proxy_protocol)
                    .with_target(&config.target_address, config.target_port),
            ),
        };

        self.visiting.remove(name);
        let outbound = Arc::new(Outbound::new(&config.name, kind));
        self.built.insert(config.name.clone(), outbound.clone());
        Ok(outbound)
    }

    fn previous_counter(&self, name: &str) -> Option<Arc<std::sync::atomic::AtomicI32>> {
        match self.ctx.previous?.get(name)?.kind() {
            OutboundKind::Minecraft(previous) => Some(previous.online_counter().clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MinecraftOptions;
    use std::sync::atomic::Ordering;

    fn plain(name: &str, dialer: Option<&str>) -> OutboundConfig {
        OutboundConfig {
            name: name.to_string(),
            dialer: dialer.map(str::to_string),
            target_address: "127.0.0.1".to_string(),
            target_port: 25565,
            ..OutboundConfig::default()
        }
    }

    fn minecraft(name: &str) -> OutboundConfig {
        OutboundConfig {
            minecraft: Some(MinecraftOptions::default()),
            ..plain(name, None)
        }
    }

    struct Fixture {
        lists: ListMap,
        system: Arc<SystemDialer>,
        pool: Arc<BufferPool>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                lists: ListMap::new(),
                system: Arc::new(SystemDialer::default()),
                pool: Arc::new(BufferPool::with_defaults()),
            }
        }

        fn ctx<'a>(&'a self, previous: Option<&'a OutboundMap>) -> BuildContext<'a> {
            BuildContext {
                lists: &self.lists,
                system: &self.system,
                pool: &self.pool,
                previous,
            }
        }
    }

    #[test]
    fn test_dependency_order_independent_of_declaration() {
        let fixture = Fixture::new();
        let configs = vec![plain("front", Some("middle")), plain("middle", Some("back")), plain("back", None)];
        let built = build_outbounds(&configs, fixture.ctx(None)).unwrap();
        assert_eq!(built.len(), 3);
        assert!(built["front"].capabilities().metadata_dial);
    }

    #[test]
    fn test_cycle_rejected() {
        let fixture = Fixture::new();
        let configs = vec![plain("a", Some("b")), plain("b", Some("a"))];
        assert!(matches!(
            build_outbounds(&configs, fixture.ctx(None)),
            Err(ConfigError::DialerCycle(_))
        ));

        let own = vec![plain("self", Some("self"))];
        assert!(matches!(
            build_outbounds(&own, fixture.ctx(None)),
            Err(ConfigError::DialerCycle(name)) if name == "self"
        ));
    }

    #[test]
    fn test_unknown_dialer_rejected() {
        let fixture = Fixture::new();
        let configs = vec![plain("a", Some("missing"))];
        assert!(matches!(
            build_outbounds(&configs, fixture.ctx(None)),
            Err(ConfigError::OutboundNotFound(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_duplicate_and_reserved_names() {
        let fixture = Fixture::new();
        assert!(matches!(
            build_outbounds(&[plain("a", None), plain("a", None)], fixture.ctx(None)),
            Err(ConfigError::DuplicateOutbound(_))
        ));
        assert!(matches!(
            build_outbounds(&[plain("RESET", None)], fixture.ctx(None)),
            Err(ConfigError::DuplicateOutbound(_))
        ));
    }

    #[test]
    fn test_invalid_proxy_version() {
        let fixture = Fixture::new();
        let config = OutboundConfig {
            proxy_protocol_version: 3,
            ..plain("a", None)
        };
        assert!(matches!(
            build_outbounds(&[config], fixture.ctx(None)),
            Err(ConfigError::InvalidProxyVersion(3))
        ));
    }

    #[test]
    fn test_capabilities() {
        let fixture = Fixture::new();
        let built = build_outbounds(&[minecraft("mc"), plain("p", None)], fixture.ctx(None)).unwrap();
        assert!(built["mc"].capabilities().inject);
        assert!(!built["p"].capabilities().inject);
        assert!(Outbound::reject().capabilities().inject);
        assert!(fixture.system.capabilities().srv_dial);
    }

    #[test]
    fn test_online_counter_survives_rebuild() {
        let fixture = Fixture::new();
        let first = build_outbounds(&[minecraft("mc")], fixture.ctx(None)).unwrap();
        let OutboundKind::Minecraft(mc) = first["mc"].kind() else {
            panic!("expected a Minecraft outbound");
        };
        mc.online_counter().fetch_add(3, Ordering::Relaxed);

        let second = build_outbounds(&[minecraft("mc")], fixture.ctx(Some(&first))).unwrap();
        let OutboundKind::Minecraft(mc) = second["mc"].kind() else {
            panic!("expected a Minecraft outbound");
        };
        assert_eq!(mc.online(), 3);
    }

    #[tokio::test]
    async fn test_injecting_outbound_cannot_dial() {
        let fixture = Fixture::new();
        let built = build_outbounds(&[minecraft("mc")], fixture.ctx(None)).unwrap();
        let err = built["mc"].dial("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, OutboundError::InjectionRequired(name) if name == "mc"));
    }
}
