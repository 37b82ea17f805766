//! Routing rules.
//!
//! Rules are built once per configuration generation and are read-only
//! afterwards. A rule is a predicate over [`Metadata`] plus what to do when
//! it matches: which protocols to sniff first, how to rewrite the
//! destination and which outbound takes the connection.
//!
//! Rule types:
//!
//! | type                  | parameter                                         |
//! |-----------------------|---------------------------------------------------|
//! | `always`              | none                                              |
//! | `and`, `or`           | array of rules                                    |
//! | `ServiceName`         | names (string or array, `list:<tag>` allowed)      |
//! | `SourceIP`            | addresses and CIDRs (`list:<tag>` allowed)         |
//! | `SourceIPVersion`     | `4` or `6`                                        |
//! | `SourcePort`          | ports (`list:<tag>` allowed)                       |
//! | `MinecraftHostname`   | `{"domain": [..], "domain_suffix": [..]}`          |
//! | `MinecraftPlayerName` | names (`list:<tag>` allowed)                       |
//! | `custom:<name>`       | whatever the registered factory accepts           |

pub mod custom;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use craftgate_networking::{DomainMatcher, IpSet, StringSet};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::{Listable, RuleConfig, RuleRewrite};
use crate::error::ConfigError;
use crate::metadata::Metadata;
use crate::proxy::sniff::SnifferRegistry;

pub use custom::{CustomRule, CustomRuleFactory, CustomRuleRegistry};

/// Named lists by tag.
pub type ListMap = HashMap<String, Arc<StringSet>>;

/// Prefix marking a reference to a named list inside a rule parameter.
pub const LIST_PREFIX: &str = "list:";

const CUSTOM_PREFIX: &str = "custom:";

/// What a rule needs from its surroundings while being built.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub lists: &'a ListMap,
    pub sniffers: &'a SnifferRegistry,
    pub custom: &'a CustomRuleRegistry,
}

/// Resolve list tags to their sets.
pub fn find_lists(lists: &ListMap, tags: &[String]) -> Result<Vec<Arc<StringSet>>, ConfigError> {
    tags.iter()
        .map(|tag| {
            lists
                .get(tag)
                .cloned()
                .ok_or_else(|| ConfigError::ListNotFound(tag.clone()))
        })
        .collect()
}

/// Inline names plus referenced lists.
#[derive(Debug, Clone, Default)]
pub struct NameSet {
    inline: StringSet,
    lists: Vec<Arc<StringSet>>,
}

impl NameSet {
    fn build(items: &[String], lists: &ListMap) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        for item in items {
            match item.strip_prefix(LIST_PREFIX) {
                Some(tag) => set.lists.push(find_list(lists, tag)?),
                None => {
                    set.inline.insert(item.clone());
                }
            }
        }
        Ok(set)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inline.has(name) || self.lists.iter().any(|list| list.has(name))
    }
}

enum RuleKind {
    Always,
    And(Vec<Rule>),
    Or(Vec<Rule>),
    ServiceName(NameSet),
    SourceIp(IpSet),
    SourceIpVersion(u8),
    SourcePort(HashSet<u16>),
    MinecraftHostname(DomainMatcher),
    MinecraftPlayerName(NameSet),
    Custom { name: String, rule: Arc<dyn CustomRule> },
}

impl fmt::Debug for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::And(children) => f.debug_tuple("And").field(children).finish(),
            Self::Or(children) => f.debug_tuple("Or").field(children).finish(),
            Self::ServiceName(names) => f.debug_tuple("ServiceName").field(names).finish(),
            Self::SourceIp(set) => f.debug_tuple("SourceIp").field(set).finish(),
            Self::SourceIpVersion(version) => f.debug_tuple("SourceIpVersion").field(version).finish(),
            Self::SourcePort(ports) => f.debug_tuple("SourcePort").field(ports).finish(),
            Self::MinecraftHostname(matcher) => {
                f.debug_tuple("MinecraftHostname").field(&matcher.len()).finish()
            }
            Self::MinecraftPlayerName(names) => {
                f.debug_tuple("MinecraftPlayerName").field(names).finish()
            }
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

#[derive(Debug)]
pub struct Rule {
    kind: RuleKind,
    sniff: Vec<String>,
    rewrite: RuleRewrite,
    outbound: Option<String>,
    invert: bool,
}

impl Rule {
    /// Build a rule, resolving list references and checking sniffer names.
    pub fn build(config: &RuleConfig, ctx: RuleContext<'_>) -> Result<Self, ConfigError> {
        ctx.sniffers.validate(&config.sniff[..])?;
        let rule_type = config.rule_type.as_str();
        let parameter = &config.parameter;

        let kind = match rule_type {
            "always" => RuleKind::Always,
            "and" | "or" => {
                let children: Vec<RuleConfig> = parse(rule_type, parameter)?;
                let children = children
                    .iter()
                    .map(|child| Self::build(child, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                if rule_type == "and" {
                    RuleKind::And(children)
                } else {
                    RuleKind::Or(children)
                }
            }
            "ServiceName" | "service_name" => {
                let names: Listable<String> = parse(rule_type, parameter)?;
                RuleKind::ServiceName(NameSet::build(&names, ctx.lists)?)
            }
            "SourceIP" | "source_ip" => {
                let entries: Listable<String> = parse(rule_type, parameter)?;
                RuleKind::SourceIp(build_ip_set(&entries, ctx.lists)?)
            }
            "SourceIPVersion" | "source_ip_version" => {
                let version: IpVersionParameter = parse(rule_type, parameter)?;
                let version = version.number();
                if version != 4 && version != 6 {
                    return Err(ConfigError::parameter(rule_type, format!("IP version must be 4 or 6, got {version}")));
                }
                RuleKind::SourceIpVersion(version)
            }
            "SourcePort" | "source_port" => {
                let entries: Listable<PortEntry> = parse(rule_type, parameter)?;
                RuleKind::SourcePort(build_port_set(rule_type, &entries, ctx.lists)?)
            }
            "MinecraftHostname" | "minecraft_hostname" => {
                let domains: DomainParameter = parse(rule_type, parameter)?;
                RuleKind::MinecraftHostname(domains.build(ctx.lists)?)
            }
            "MinecraftPlayerName" | "minecraft_player_name" => {
                let names: Listable<String> = parse(rule_type, parameter)?;
                RuleKind::MinecraftPlayerName(NameSet::build(&names, ctx.lists)?)
            }
            other => match other.strip_prefix(CUSTOM_PREFIX) {
                Some(name) => RuleKind::Custom {
                    name: name.to_string(),
                    rule: ctx.custom.build(name, parameter, ctx.lists)?,
                },
                None => return Err(ConfigError::UnknownRuleType(other.to_string())),
            },
        };

        Ok(Self {
            kind,
            sniff: config.sniff.to_vec(),
            rewrite: config.rewrite.clone(),
            outbound: config.outbound.clone(),
            invert: config.invert,
        })
    }

    /// Evaluate the predicate, including the invert flag.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        let matched = match &self.kind {
            RuleKind::Always => true,
            RuleKind::And(children) => children.iter().all(|child| child.matches(metadata)),
            RuleKind::Or(children) => children.iter().any(|child| child.matches(metadata)),
            RuleKind::ServiceName(names) => names.contains(&metadata.service_name),
            RuleKind::SourceIp(set) => set.contains(metadata.source.ip()),
            RuleKind::SourceIpVersion(version) => {
                let actual = match metadata.source.ip() {
                    IpAddr::V4(_) => 4,
                    IpAddr::V6(_) => 6,
                };
                actual == *version
            }
            RuleKind::SourcePort(ports) => ports.contains(&metadata.source.port()),
            RuleKind::MinecraftHostname(matcher) => metadata
                .minecraft
                .as_ref()
                .is_some_and(|mc| matcher.matches(mc.clean_origin_destination())),
            RuleKind::MinecraftPlayerName(names) => metadata
                .minecraft
                .as_ref()
                .is_some_and(|mc| names.contains(&mc.player_name)),
            RuleKind::Custom { rule, .. } => rule.matches(metadata),
        };
        matched != self.invert
    }

    /// Protocols to sniff before evaluating, including those of nested rules.
    pub fn sniff_protocols(&self) -> Vec<&str> {
        let mut protocols = Vec::new();
        self.collect_sniff(&mut protocols);
        protocols
    }

    fn collect_sniff<'a>(&'a self, out: &mut Vec<&'a str>) {
        for protocol in &self.sniff {
            if !out.contains(&protocol.as_str()) {
                out.push(protocol);
            }
        }
        if let RuleKind::And(children) | RuleKind::Or(children) = &self.kind {
            for child in children {
                child.collect_sniff(out);
            }
        }
    }

    /// Apply this rule's destination rewrites to `metadata`.
    ///
    /// The Minecraft rewrite needs a Minecraft record; without one it is
    /// skipped. The generic rewrite always applies.
    pub fn apply_rewrite(&self, metadata: &mut Metadata) {
        if let Some(rewrite) = &self.rewrite.minecraft {
            match metadata.minecraft.as_mut() {
                Some(mc) => {
                    if let Some(hostname) = &rewrite.hostname {
                        mc.rewritten_destination = Some(hostname.clone());
                    }
                    if let Some(port) = rewrite.port {
                        mc.rewritten_port = Some(port);
                    }
                }
                None => debug!(id = %metadata.id, "Minecraft rewrite skipped: no Minecraft metadata"),
            }
        }
        if let Some(address) = &self.rewrite.target_address {
            metadata.destination_hostname = address.clone();
        }
        if let Some(port) = self.rewrite.target_port {
            metadata.destination_port = port;
        }
    }

    pub fn outbound(&self) -> Option<&str> {
        self.outbound.as_deref()
    }

    /// Names of every outbound this rule or its children select.
    pub fn outbound_references(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.outbound.as_deref().into_iter().collect();
        if let RuleKind::And(children) | RuleKind::Or(children) = &self.kind {
            for child in children {
                names.extend(child.outbound_references());
            }
        }
        names
    }
}

fn parse<T: DeserializeOwned>(rule_type: &str, parameter: &serde_json::Value) -> Result<T, ConfigError> {
    T::deserialize(parameter).map_err(|e| ConfigError::parameter(rule_type, e))
}

fn find_list(lists: &ListMap, tag: &str) -> Result<Arc<StringSet>, ConfigError> {
    lists
        .get(tag)
        .cloned()
        .ok_or_else(|| ConfigError::ListNotFound(tag.to_string()))
}

fn build_ip_set(entries: &[String], lists: &ListMap) -> Result<IpSet, ConfigError> {
    let mut all = Vec::new();
    for entry in entries {
        match entry.strip_prefix(LIST_PREFIX) {
            Some(tag) => all.extend(find_list(lists, tag)?.iter().cloned()),
            None => all.push(entry.clone()),
        }
    }
    Ok(IpSet::from_entries(&all)?)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IpVersionParameter {
    Number(u8),
    Text(String),
}

impl IpVersionParameter {
    fn number(&self) -> u8 {
        match self {
            Self::Number(n) => *n,
            Self::Text(text) => text.trim().parse().unwrap_or(0),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortEntry {
    Port(u16),
    Text(String),
}

fn build_port_set(rule_type: &str, entries: &[PortEntry], lists: &ListMap) -> Result<HashSet<u16>, ConfigError> {
    let parse_port = |text: &str| {
        text.trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::parameter(rule_type, format!("bad port [{text}]")))
    };

    let mut ports = HashSet::new();
    for entry in entries {
        match entry {
            PortEntry::Port(port) => {
                ports.insert(*port);
            }
            PortEntry::Text(text) => match text.strip_prefix(LIST_PREFIX) {
                Some(tag) => {
                    for item in find_list(lists, tag)?.iter() {
                        ports.insert(parse_port(item)?);
                    }
                }
                None => {
                    ports.insert(parse_port(text)?);
                }
            },
        }
    }
    Ok(ports)
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DomainParameter {
    domain: Listable<String>,
    domain_suffix: Listable<String>,
}

impl DomainParameter {
    fn build(&self, lists: &ListMap) -> Result<DomainMatcher, ConfigError> {
        let mut builder = DomainMatcher::builder();
        for_each_entry(&self.domain, lists, |entry| builder.push_domain(entry))?;
        for_each_entry(&self.domain_suffix, lists, |entry| builder.push_domain_suffix(entry))?;
        Ok(builder.build())
    }
}

fn for_each_entry(
    items: &[String],
    lists: &ListMap,
    mut f: impl FnMut(&str),
) -> Result<(), ConfigError> {
    for item in items {
        match item.strip_prefix(LIST_PREFIX) {
            Some(tag) => find_list(lists, tag)?.iter().for_each(|entry| f(entry)),
            None => f(item),
        }
    }
    Ok(())
}
