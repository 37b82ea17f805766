//! Gateway configuration.
//!
//! Process settings come from CLI flags with environment fallbacks. Routing
//! settings live in a JSON document that can be reloaded while running.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use craftgate_networking::{AccessMode, StringSet};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// craftgate - Minecraft-aware TCP reverse proxy.
#[derive(Debug, Clone, Parser)]
#[command(name = "craftgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path of the JSON configuration document. Created with defaults if missing.
    #[arg(long, env = "CRAFTGATE_CONFIG", default_value = "craftgate.json")]
    pub config: PathBuf,

    /// Log level used when RUST_LOG is unset. Overrides `log.level` from the document.
    #[arg(long, env = "CRAFTGATE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Reload automatically when the configuration document changes.
    #[arg(long, env = "CRAFTGATE_WATCH", default_value_t = true, action = ArgAction::Set)]
    pub watch: bool,
}

/// A value that may be written as a single item or as an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listable<T>(pub Vec<T>);

impl<T> Default for Listable<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> std::ops::Deref for Listable<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<Vec<T>> for Listable<T> {
    fn from(items: Vec<T>) -> Self {
        Self(items)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Listable<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany<T> {
            Many(Vec<T>),
            One(T),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::Many(items) => Self(items),
            OneOrMany::One(item) => Self(vec![item]),
        })
    }
}

impl<T: Serialize> Serialize for Listable<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.as_slice() {
            [single] => single.serialize(serializer),
            items => items.serialize(serializer),
        }
    }
}

/// The configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Root {
    pub log: LogConfig,
    pub services: Vec<ServiceConfig>,
    pub router: RouterConfig,
    pub outbounds: Vec<OutboundConfig>,
    pub lists: HashMap<String, StringSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Access control over a set of named lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub mode: AccessMode,
    pub list_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub listen: u16,
    pub bind_address: IpAddr,
    pub target_address: String,
    pub target_port: u16,
    pub enable_proxy_protocol: bool,
    pub ip_access: AccessConfig,
    /// Set to serve this port in legacy mode: Minecraft only, no router.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minecraft: Option<MinecraftOptions>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            listen: 0,
            bind_address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            target_address: String::new(),
            target_port: 0,
            enable_proxy_protocol: false,
            ip_access: AccessConfig::default(),
            minecraft: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_outbound: Option<String>,
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub parameter: serde_json::Value,
    #[serde(skip_serializing_if = "RuleRewrite::is_empty")]
    pub rewrite: RuleRewrite,
    pub sniff: Listable<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound: Option<String>,
    pub invert: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleRewrite {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minecraft: Option<MinecraftRewrite>,
}

impl RuleRewrite {
    pub fn is_empty(&self) -> bool {
        self.target_address.is_none() && self.target_port.is_none() && self.minecraft.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinecraftRewrite {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub name: String,
    /// Name of another outbound to dial through instead of the system dialer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialer: Option<String>,
    pub target_address: String,
    pub target_port: u16,
    /// 0 disables the PROXY header, 1 and 2 select the wire version.
    pub proxy_protocol_version: u8,
    /// Present for Minecraft-aware outbounds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minecraft: Option<MinecraftOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinecraftOptions {
    pub enable_hostname_rewrite: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_hostname: Option<String>,
    pub online_count: OnlineCount,
    pub ignore_fml_suffix: bool,
    pub ignore_srv_redirect: bool,
    pub hostname_access: AccessConfig,
    pub name_access: AccessConfig,
    pub ping_mode: PingMode,
    pub motd_favicon: String,
    pub motd_description: String,
}

impl MinecraftOptions {
    /// Status requests are answered locally when either MOTD field is set.
    pub fn has_motd(&self) -> bool {
        !self.motd_favicon.is_empty() || !self.motd_description.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineCount {
    pub max: i32,
    /// Reported online players; negative reports the live connection count.
    pub online: i32,
    pub enable_max_limit: bool,
    /// Either an object of `uuid -> name` or an array of names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<serde_json::Value>,
}

impl Default for OnlineCount {
    fn default() -> Self {
        Self {
            max: 20,
            online: -1,
            enable_max_limit: false,
            sample: None,
        }
    }
}

/// What to do with the ping that follows a locally answered status request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingMode {
    /// Send the client's payload back.
    #[default]
    #[serde(alias = "")]
    Echo,
    /// Close without answering.
    Disconnect,
    /// Answer at once with a zero payload.
    #[serde(rename = "0ms")]
    ZeroMs,
}

impl Root {
    /// Parse a configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse configuration document")
    }

    /// Load the document at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Load the document at `path`, writing a generated default first if it does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let root = Self::generated();
        let text = serde_json::to_string_pretty(&root).context("Failed to encode default configuration")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write default configuration to {}", path.display()))?;
        Ok(root)
    }

    /// A starter document: one Minecraft port routed to one Minecraft outbound.
    pub fn generated() -> Self {
        Self {
            log: LogConfig::default(),
            services: vec![ServiceConfig {
                name: "minecraft".to_string(),
                listen: 25565,
                ..ServiceConfig::default()
            }],
            router: RouterConfig {
                default_outbound: None,
                rules: vec![RuleConfig {
                    rule_type: "always".to_string(),
                    sniff: Listable(vec!["minecraft".to_string()]),
                    outbound: Some("hypixel".to_string()),
                    ..RuleConfig::default()
                }],
            },
            outbounds: vec![OutboundConfig {
                name: "hypixel".to_string(),
                target_address: "mc.hypixel.net".to_string(),
                target_port: 25565,
                minecraft: Some(MinecraftOptions {
                    enable_hostname_rewrite: true,
                    ..MinecraftOptions::default()
                }),
                ..OutboundConfig::default()
            }],
            lists: HashMap::new(),
        }
    }
}
