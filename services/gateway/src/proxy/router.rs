//! Rule evaluation and dispatch.
//!
//! The router holds an immutable snapshot of rules, outbounds and lists
//! behind an [`ArcSwap`]. A connection loads the snapshot once when routing
//! starts and keeps using it until it has picked an outbound, so a reload
//! never changes the rules under a connection that is mid-evaluation. The
//! snapshot is dropped before the long-lived relay phase.
//!
//! Reloads build a complete snapshot first and swap it in only when every
//! piece was built; any error leaves the running configuration in place.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use craftgate_networking::{relay, BufferPool, StringSet};
use tracing::{debug, info, trace, warn};

use crate::config::{OutboundConfig, RouterConfig, Root};
use crate::error::{ConfigError, OutboundError};
use crate::metadata::Metadata;
use crate::proxy::outbound::{
    build_outbounds, default_outbound, dial_for, BuildContext, Dialer, Outbound, OutboundMap,
    SystemDialer,
};
use crate::proxy::rules::{self, CustomRuleRegistry, ListMap, Rule, RuleContext};
use crate::proxy::sniff::{ClientConn, SnifferRegistry};

/// Everything a reload replaces.
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    pub router: RouterConfig,
    pub outbounds: Vec<OutboundConfig>,
    pub lists: HashMap<String, StringSet>,
}

impl From<&Root> for RouterOptions {
    fn from(root: &Root) -> Self {
        Self {
            router: root.router.clone(),
            outbounds: root.outbounds.clone(),
            lists: root.lists.clone(),
        }
    }
}

/// Immutable routing state for one configuration generation.
pub struct RouterSnapshot {
    rules: Vec<Rule>,
    outbounds: OutboundMap,
    lists: ListMap,
    default_outbound: Arc<Outbound>,
}

impl RouterSnapshot {
    /// Named lists of this generation.
    pub fn lists(&self) -> &ListMap {
        &self.lists
    }

    fn empty(system: &Arc<SystemDialer>) -> Self {
        Self {
            rules: Vec::new(),
            outbounds: builtin_outbounds(),
            lists: ListMap::new(),
            default_outbound: Arc::new(default_outbound(system)),
        }
    }
}

fn builtin_outbounds() -> OutboundMap {
    [Outbound::reject(), Outbound::reset()]
        .into_iter()
        .map(|outbound| (outbound.name().to_string(), Arc::new(outbound)))
        .collect()
}

pub struct Router {
    snapshot: ArcSwap<RouterSnapshot>,
    sniffers: SnifferRegistry,
    custom: CustomRuleRegistry,
    system: Arc<SystemDialer>,
    pool: Arc<BufferPool>,
}

impl Router {
    /// Router with the built-in sniffers, no rules and a direct default outbound.
    pub fn new(system: Arc<SystemDialer>, pool: Arc<BufferPool>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouterSnapshot::empty(&system)),
            sniffers: SnifferRegistry::with_builtins(),
            custom: CustomRuleRegistry::new(),
            system,
            pool,
        }
    }

    pub fn with_sniffers(mut self, sniffers: SnifferRegistry) -> Self {
        self.sniffers = sniffers;
        self
    }

    pub fn with_custom_rules(mut self, custom: CustomRuleRegistry) -> Self {
        self.custom = custom;
        self
    }

    pub fn system_dialer(&self) -> &Arc<SystemDialer> {
        &self.system
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Build a new configuration generation and make it live.
    ///
    /// Nothing changes unless every list, outbound and rule was built and
    /// every outbound a rule names exists.
    pub fn apply(&self, options: &RouterOptions) -> Result<(), ConfigError> {
        let snapshot = self.prepare(options)?;
        self.commit(snapshot);
        Ok(())
    }

    /// Build a configuration generation without making it live.
    pub fn prepare(&self, options: &RouterOptions) -> Result<RouterSnapshot, ConfigError> {
        let lists: ListMap = options
            .lists
            .iter()
            .map(|(tag, set)| (tag.clone(), Arc::new(set.clone())))
            .collect();

        let previous = self.snapshot.load_full();
        let mut outbounds = build_outbounds(
            &options.outbounds,
            BuildContext {
                lists: &lists,
                system: &self.system,
                pool: &self.pool,
                previous: Some(&previous.outbounds),
            },
        )?;
        outbounds.extend(builtin_outbounds());

        let default_outbound = match options.router.default_outbound.as_deref() {
            Some(name) if !name.is_empty() => lookup(&outbounds, name)?,
            _ => Arc::new(default_outbound(&self.system)),
        };

        let ctx = RuleContext {
            lists: &lists,
            sniffers: &self.sniffers,
            custom: &self.custom,
        };
        let rules = options
            .router
            .rules
            .iter()
            .map(|config| Rule::build(config, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        for rule in &rules {
            for name in rule.outbound_references() {
                lookup(&outbounds, name)?;
            }
        }

        Ok(RouterSnapshot {
            rules,
            outbounds,
            lists,
            default_outbound,
        })
    }

    /// Make a prepared generation live.
    pub fn commit(&self, snapshot: RouterSnapshot) {
        info!(
            rules = snapshot.rules.len(),
            outbounds = snapshot.outbounds.len(),
            lists = snapshot.lists.len(),
            default_outbound = %snapshot.default_outbound.name(),
            "Router configuration applied"
        );
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Look up an outbound of the live configuration, built-ins included.
    pub fn find_outbound(&self, name: &str) -> Option<Arc<Outbound>> {
        self.snapshot.load().outbounds.get(name).cloned()
    }

    /// Resolve list tags against the live configuration.
    pub fn find_lists(&self, tags: &[String]) -> Result<Vec<Arc<StringSet>>, ConfigError> {
        rules::find_lists(&self.snapshot.load().lists, tags)
    }

    /// The live named lists.
    pub fn lists(&self) -> ListMap {
        self.snapshot.load().lists.clone()
    }

    /// Route `conn` and hand it to the selected outbound.
    pub async fn handle_connection(&self, mut conn: ClientConn, mut metadata: Metadata) {
        let Some(outbound) = self.route(&mut conn, &mut metadata).await else {
            return;
        };
        self.dispatch(&outbound, &mut conn, &mut metadata).await;
    }

    /// Scan the rules and return the selected outbound.
    ///
    /// Every sniff attempt starts from the cache position the connection
    /// had when routing began. The first matching rule ends the scan.
    pub async fn route(&self, conn: &mut ClientConn, metadata: &mut Metadata) -> Option<Arc<Outbound>> {
        let snapshot = self.snapshot.load_full();
        let start = conn.current_position().unwrap_or(0);

        for (index, rule) in snapshot.rules.iter().enumerate() {
            let protocols = rule.sniff_protocols();
            if !protocols.is_empty() {
                self.sniffers.sniff(conn, metadata, &protocols[..], start).await;
            }
            if !rule.matches(metadata) {
                continue;
            }
            trace!(id = %metadata.id, rule_index = index, "Rule matched");
            rule.apply_rewrite(metadata);

            return match rule.outbound() {
                Some(name) => match snapshot.outbounds.get(name) {
                    Some(outbound) => Some(outbound.clone()),
                    None => {
                        warn!(id = %metadata.id, rule_index = index, outbound = name, "Failed to find outbound");
                        None
                    }
                },
                None => Some(snapshot.default_outbound.clone()),
            };
        }

        Some(snapshot.default_outbound.clone())
    }

    async fn dispatch(&self, outbound: &Outbound, conn: &mut ClientConn, metadata: &mut Metadata) {
        let name = outbound.name();

        if outbound.capabilities().inject {
            match outbound.inject(conn, metadata).await {
                Ok(()) => debug!(id = %metadata.id, outbound = name, "Handled outbound connection"),
                Err(OutboundError::Rejected(by)) => {
                    info!(id = %metadata.id, outbound = name, rejected_by = by, "Rejected connection")
                }
                Err(e) => warn!(id = %metadata.id, outbound = name, error = %e, "Outbound connection failed"),
            }
            return;
        }

        outbound.fill_destination(metadata);
        if !metadata.has_destination() {
            warn!(id = %metadata.id, outbound = name, "Closed leaked connection");
            return;
        }

        let address = metadata.destination_address();
        let mut upstream = match dial_for(outbound, &address, metadata).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(id = %metadata.id, outbound = name, address = %address, error = %e, "Failed to dial outbound connection");
                return;
            }
        };

        debug!(id = %metadata.id, outbound = name, address = %address, "Relay started");
        match relay(conn, &mut upstream, &self.pool).await {
            Ok(stats) => info!(
                id = %metadata.id,
                outbound = name,
                uploaded = stats.uploaded,
                downloaded = stats.downloaded,
                "Relay finished"
            ),
            Err(e) => debug!(id = %metadata.id, outbound = name, error = %e, "Relay ended with error"),
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("Router")
            .field("rules", &snapshot.rules.len())
            .field("outbounds", &snapshot.outbounds.len())
            .field("sniffers", &self.sniffers)
            .field("custom", &self.custom)
            .finish()
    }
}

fn lookup(outbounds: &OutboundMap, name: &str) -> Result<Arc<Outbound>, ConfigError> {
    outbounds
        .get(name)
        .cloned()
        .ok_or_else(|| ConfigError::OutboundNotFound(name.to_string()))
}
