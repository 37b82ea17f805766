//! Minecraft-aware injecting outbound.
//!
//! Takes over a client whose handshake was sniffed:
//! - status: relay the upstream's status, or answer locally with a MOTD
//! - login: apply name access control and the player limit, then connect
//!   upstream with a rebuilt handshake and relay
//! - transfer: reset

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use craftgate_networking::varint::{put_packet, put_string};
use craftgate_networking::{check_access, relay, BufferPool, StringSet, Version};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::builtin;
use super::motd::{self, Motd};
use super::plain::write_proxy_header;
use super::{dial_for, Dialer};
use crate::config::{MinecraftOptions, PingMode};
use crate::error::{ConfigError, OutboundError, SniffError};
use crate::metadata::{MinecraftMetadata, Metadata, NextState, SrvMetadata};
use crate::proxy::rules::{find_lists, ListMap};
use crate::proxy::sniff::minecraft::Handshake;
use crate::proxy::sniff::{read_varint, timed, ClientConn, SNIFF_STEP_TIMEOUT};

/// SRV service consulted unless `ignore_srv_redirect` is set.
pub const SRV_SERVICE: &str = "minecraft";

const STATUS_RESPONSE_PACKET_ID: u8 = 0x00;
const STATUS_REQUEST: [u8; 2] = [0x01, 0x00];
const PING_PACKET_ID: u8 = 0x01;
const LOGIN_DISCONNECT_PACKET_ID: u8 = 0x00;
const MAX_PING_LEN: usize = 9;

pub struct MinecraftOutbound {
    name: String,
    options: MinecraftOptions,
    target_address: String,
    target_port: u16,
    via: Arc<dyn Dialer>,
    proxy_protocol: Option<Version>,
    hostname_lists: Vec<Arc<StringSet>>,
    name_lists: Vec<Arc<StringSet>>,
    motd: Option<Motd>,
    online: Arc<AtomicI32>,
    pool: Arc<BufferPool>,
    step_timeout: Duration,
}

impl MinecraftOutbound {
    /// Resolve access lists and pre-render the MOTD.
    pub fn new(
        name: impl Into<String>,
        options: MinecraftOptions,
        target_address: impl Into<String>,
        target_port: u16,
        lists: &ListMap,
        via: Arc<dyn Dialer>,
        pool: Arc<BufferPool>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let target_address = target_address.into();

        let hostname_lists = if options.hostname_access.mode.is_enabled() {
            find_lists(lists, &options.hostname_access.list_tags)?
        } else {
            Vec::new()
        };
        let name_lists = if options.name_access.mode.is_enabled() {
            find_lists(lists, &options.name_access.list_tags)?
        } else {
            Vec::new()
        };
        let motd = if options.has_motd() {
            Some(Motd::new(&name, &options, &target_address, target_port)?)
        } else {
            None
        };

        Ok(Self {
            name,
            options,
            target_address,
            target_port,
            via,
            proxy_protocol: None,
            hostname_lists,
            name_lists,
            motd,
            online: Arc::new(AtomicI32::new(0)),
            pool,
            step_timeout: SNIFF_STEP_TIMEOUT,
        })
    }

    pub fn with_proxy_protocol(mut self, version: Option<Version>) -> Self {
        self.proxy_protocol = version;
        self
    }

    /// Share a player counter, typically the one of the outbound this
    /// replaces on reload.
    pub fn with_online_counter(mut self, online: Arc<AtomicI32>) -> Self {
        self.online = online;
        self
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn online_counter(&self) -> &Arc<AtomicI32> {
        &self.online
    }

    pub fn online(&self) -> i32 {
        self.online.load(Ordering::Relaxed)
    }

    /// Serve a client whose Minecraft handshake has been sniffed.
    pub async fn inject(&self, conn: &mut ClientConn, metadata: &mut Metadata) -> Result<(), OutboundError> {
        let mc = metadata
            .minecraft
            .clone()
            .ok_or(OutboundError::MissingMinecraftMetadata)?;

        if !check_access(
            self.hostname_lists.iter().map(|list| &**list),
            self.options.hostname_access.mode,
            mc.clean_origin_destination(),
        ) {
            builtin::reset(conn)?;
            return Err(OutboundError::Rejected("hostname access control"));
        }

        if let Some(position) = mc.sniff_position {
            conn.rewind(position);
        }

        match mc.next_state {
            NextState::Status => self.serve_status(conn, metadata, &mc).await,
            NextState::Login => self.serve_login(conn, metadata, &mc).await,
            NextState::Transfer => {
                builtin::reset(conn)?;
                Ok(())
            }
        }
    }

    async fn serve_status(
        &self,
        conn: &mut ClientConn,
        metadata: &mut Metadata,
        mc: &MinecraftMetadata,
    ) -> Result<(), OutboundError> {
        timed(self.step_timeout, conn.peek(STATUS_REQUEST.len())).await?;
        conn.consume(STATUS_REQUEST.len());

        let Some(motd) = &self.motd else {
            let mut upstream = self.connect_server(metadata).await?;
            let mut request = self.upstream_handshake(mc, NextState::Status);
            request.extend_from_slice(&STATUS_REQUEST);
            upstream.write_all(&request).await?;
            relay(conn, &mut upstream, &self.pool).await?;
            return Ok(());
        };

        let status = motd
            .render(mc.protocol_version, self.online())
            .map_err(std::io::Error::from)?;
        let mut payload = self.pool.scratch();
        payload.put_u8(STATUS_RESPONSE_PACKET_ID);
        put_string(&mut *payload, &status);
        let mut packet = self.pool.scratch();
        put_packet(&mut *packet, &payload);
        conn.get_mut().write_all(&packet).await?;

        match self.options.ping_mode {
            PingMode::Disconnect => {}
            PingMode::ZeroMs => {
                packet.clear();
                put_packet(&mut *packet, &[PING_PACKET_ID, 0, 0, 0, 0, 0, 0, 0, 0]);
                conn.get_mut().write_all(&packet).await?;
            }
            PingMode::Echo => {
                let len = read_varint(conn, self.step_timeout).await?;
                let len = usize::try_from(len)
                    .ok()
                    .filter(|len| (1..=MAX_PING_LEN).contains(len))
                    .ok_or(SniffError::BadPacket("bad ping packet length"))?;
                let ping = timed(self.step_timeout, conn.peek(len)).await?.to_vec();
                conn.consume(len);
                packet.clear();
                put_packet(&mut *packet, &ping);
                conn.get_mut().write_all(&packet).await?;
            }
        }

        info!(id = %metadata.id, outbound = %self.name, "Responded MOTD");
        conn.shutdown_inner().await?;
        Ok(())
    }

    async fn serve_login(
        &self,
        conn: &mut ClientConn,
        metadata: &mut Metadata,
        mc: &MinecraftMetadata,
    ) -> Result<(), OutboundError> {
        if !check_access(
            self.name_lists.iter().map(|list| &**list),
            self.options.name_access.mode,
            &mc.player_name,
        ) {
            self.kick(conn, &motd::access_denied_message(&mc.player_name)).await?;
            warn!(id = %metadata.id, outbound = %self.name, player = %mc.player_name, "Kicked by name access control");
            return Ok(());
        }

        let limit = &self.options.online_count;
        if limit.enable_max_limit && limit.max <= self.online() {
            self.kick(conn, &motd::server_full_message(&mc.player_name, limit.max)).await?;
            warn!(id = %metadata.id, outbound = %self.name, player = %mc.player_name, "Kicked by player number limiter");
            return Ok(());
        }

        let mut upstream = self.connect_server(metadata).await?;
        upstream
            .write_all(&self.upstream_handshake(mc, NextState::Login))
            .await?;
        info!(id = %metadata.id, outbound = %self.name, player = %mc.player_name, "Created Minecraft connection");

        let _online = OnlineGuard::enter(&self.online);
        let stats = relay(conn, &mut upstream, &self.pool).await?;
        info!(
            id = %metadata.id,
            outbound = %self.name,
            player = %mc.player_name,
            uploaded = stats.uploaded,
            downloaded = stats.downloaded,
            "Minecraft connection closed"
        );
        Ok(())
    }

    /// Send a login Disconnect with `reason` and close.
    async fn kick(&self, conn: &mut ClientConn, reason: &serde_json::Value) -> Result<(), OutboundError> {
        let mut payload = self.pool.scratch();
        payload.put_u8(LOGIN_DISCONNECT_PACKET_ID);
        put_string(&mut *payload, &reason.to_string());
        let mut packet = self.pool.scratch();
        put_packet(&mut *packet, &payload);
        conn.get_mut().write_all(&packet).await?;
        conn.shutdown_inner().await?;
        Ok(())
    }

    async fn connect_server(&self, metadata: &mut Metadata) -> Result<TcpStream, OutboundError> {
        if metadata.destination_hostname.is_empty() {
            metadata.destination_hostname = self.target_address.clone();
        }
        if metadata.destination_port == 0 {
            metadata.destination_port = self.target_port;
        }
        if !self.options.ignore_srv_redirect {
            metadata.srv = Some(SrvMetadata {
                service_name: SRV_SERVICE.to_string(),
            });
        }

        let mut upstream = dial_for(self.via.as_ref(), &metadata.destination_address(), metadata).await?;
        if let Some(version) = self.proxy_protocol {
            write_proxy_header(&mut upstream, version, metadata).await?;
        }
        Ok(upstream)
    }

    /// Hostname announced to the upstream.
    fn upstream_hostname(&self, mc: &MinecraftMetadata) -> String {
        let mut hostname = if self.options.enable_hostname_rewrite {
            match self.options.rewritten_hostname.as_deref() {
                Some(hostname) if !hostname.is_empty() => hostname.to_string(),
                _ => self.target_address.clone(),
            }
        } else {
            mc.destination().to_string()
        };
        if !self.options.ignore_fml_suffix && mc.is_fml() {
            if let Some(markup) = mc.fml_markup() {
                hostname.push('\0');
                hostname.push_str(markup);
            }
        }
        hostname
    }

    /// Framed handshake packet for the upstream.
    fn upstream_handshake(&self, mc: &MinecraftMetadata, next_state: NextState) -> Vec<u8> {
        let mut buf = Vec::new();
        Handshake {
            protocol_version: mc.protocol_version,
            address: self.upstream_hostname(mc),
            port: mc.port(),
            next_state,
        }
        .encode(&mut buf);
        buf
    }
}

impl std::fmt::Debug for MinecraftOutbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinecraftOutbound")
            .field("name", &self.name)
            .field("target_address", &self.target_address)
            .field("target_port", &self.target_port)
            .field("via", &self.via.name())
            .field("online", &self.online())
            .finish_non_exhaustive()
    }
}

/// Counts a player for as long as it is held.
struct OnlineGuard(Arc<AtomicI32>);

impl OnlineGuard {
    fn enter(counter: &Arc<AtomicI32>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for OnlineGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessConfig;
    use crate::proxy::outbound::system::SystemDialer;
    use craftgate_networking::AccessMode;
    use uuid::Uuid;

    fn record(origin: &str) -> MinecraftMetadata {
        MinecraftMetadata {
            protocol_version: 763,
            origin_destination: origin.to_string(),
            origin_port: 25565,
            rewritten_destination: None,
            rewritten_port: None,
            player_name: "Steve".to_string(),
            uuid: Uuid::nil(),
            next_state: NextState::Login,
            sniff_position: Some(0),
        }
    }

    fn outbound(options: MinecraftOptions, lists: &ListMap) -> Result<MinecraftOutbound, ConfigError> {
        MinecraftOutbound::new(
            "lobby",
            options,
            "backend.internal",
            25565,
            lists,
            Arc::new(SystemDialer::default()),
            Arc::new(BufferPool::with_defaults()),
        )
    }

    #[test]
    fn test_hostname_passthrough_and_rewrite() {
        let plain = outbound(MinecraftOptions::default(), &ListMap::new()).unwrap();
        let mut mc = record("play.example.com");
        assert_eq!(plain.upstream_hostname(&mc), "play.example.com");
        mc.rewritten_destination = Some("lobby.example.com".to_string());
        assert_eq!(plain.upstream_hostname(&mc), "lobby.example.com");

        let rewriting = outbound(
            MinecraftOptions {
                enable_hostname_rewrite: true,
                ..MinecraftOptions::default()
            },
            &ListMap::new(),
        )
        .unwrap();
        assert_eq!(rewriting.upstream_hostname(&mc), "backend.internal");

        let named = outbound(
            MinecraftOptions {
                enable_hostname_rewrite: true,
                rewritten_hostname: Some("mc.hypixel.net".to_string()),
                ..MinecraftOptions::default()
            },
            &ListMap::new(),
        )
        .unwrap();
        assert_eq!(named.upstream_hostname(&mc), "mc.hypixel.net");
    }

    #[test]
    fn test_forge_suffix_kept_unless_ignored() {
        let mc = record("play.example.com\0FML3\0");
        let keep = outbound(MinecraftOptions::default(), &ListMap::new()).unwrap();
        assert_eq!(keep.upstream_hostname(&mc), "play.example.com\0FML3\0");

        let strip = outbound(
            MinecraftOptions {
                ignore_fml_suffix: true,
                ..MinecraftOptions::default()
            },
            &ListMap::new(),
        )
        .unwrap();
        assert_eq!(strip.upstream_hostname(&mc), "play.example.com");
    }

    #[test]
    fn test_upstream_handshake_uses_rewritten_port() {
        let out = outbound(MinecraftOptions::default(), &ListMap::new()).unwrap();
        let mut mc = record("play.example.com");
        mc.rewritten_port = Some(25570);
        let packet = out.upstream_handshake(&mc, NextState::Login);
        let body = &packet[1..];
        let decoded = Handshake::decode(body).unwrap();
        assert_eq!(decoded.port, 25570);
        assert_eq!(decoded.address, "play.example.com");
        assert_eq!(decoded.next_state, NextState::Login);
        assert_eq!(decoded.protocol_version, 763);
    }

    #[test]
    fn test_missing_access_list_is_config_error() {
        let options = MinecraftOptions {
            name_access: AccessConfig {
                mode: AccessMode::Allow,
                list_tags: vec!["friends".to_string()],
            },
            ..MinecraftOptions::default()
        };
        assert!(matches!(
            outbound(options, &ListMap::new()),
            Err(ConfigError::ListNotFound(tag)) if tag == "friends"
        ));
    }

    #[test]
    fn test_online_guard() {
        let counter = Arc::new(AtomicI32::new(0));
        {
            let _a = OnlineGuard::enter(&counter);
            let _b = OnlineGuard::enter(&counter);
            assert_eq!(counter.load(Ordering::Relaxed), 2);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
