//! Listening services.
//!
//! A [`Service`] owns one TCP listener. Each accepted connection runs in
//! its own task: IP access control, the optional inbound PROXY header, then
//! either the router or, in legacy mode, a dedicated Minecraft outbound.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use craftgate_networking::proxy_protocol::{read_header, DEFAULT_READ_TIMEOUT};
use craftgate_networking::{check_access, CachedStream, Command, ProxyProtocolError, StringSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ServiceConfig;
use crate::error::{ConfigError, ServiceError};
use crate::metadata::Metadata;
use crate::proxy::outbound::builtin;
use crate::proxy::outbound::MinecraftOutbound;
use crate::proxy::router::Router;
use crate::proxy::rules::{find_lists, ListMap};
use crate::proxy::sniff::minecraft::sniff_handshake;
use crate::proxy::sniff::{ClientConn, SNIFF_STEP_TIMEOUT};

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A running listener.
pub struct Service {
    config: ServiceConfig,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// State shared by every connection of one service.
struct Handler {
    config: ServiceConfig,
    router: Arc<Router>,
    ip_lists: Vec<Arc<StringSet>>,
    legacy: Option<MinecraftOutbound>,
}

/// A service whose configuration was checked but which is not bound yet.
pub struct PreparedService {
    handler: Handler,
}

impl PreparedService {
    /// Resolve list references and build the legacy outbound against
    /// `lists`, without touching the network.
    pub fn new(config: ServiceConfig, lists: &ListMap, router: Arc<Router>) -> Result<Self, ServiceError> {
        let config_error = |source: ConfigError| ServiceError::Config {
            service: config.name.clone(),
            source,
        };

        let ip_lists = if config.ip_access.mode.is_enabled() {
            find_lists(lists, &config.ip_access.list_tags).map_err(config_error)?
        } else {
            Vec::new()
        };
        let legacy = match &config.minecraft {
            Some(options) => Some(
                MinecraftOutbound::new(
                    format!("legacy-{}", config.name),
                    options.clone(),
                    config.target_address.clone(),
                    config.target_port,
                    lists,
                    router.system_dialer().clone(),
                    router.buffer_pool().clone(),
                )
                .map_err(config_error)?,
            ),
            None => None,
        };

        Ok(Self {
            handler: Handler {
                config,
                router,
                ip_lists,
                legacy,
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.handler.config.name
    }

    /// Bind the listener and start accepting.
    pub async fn bind(self) -> Result<Service, ServiceError> {
        let config = self.handler.config.clone();
        let address = SocketAddr::new(config.bind_address, config.listen);
        let listener = TcpListener::bind(address)
            .await
            .and_then(|listener| Ok((listener.local_addr()?, listener)))
            .map_err(|source| ServiceError::Bind {
                service: config.name.clone(),
                address,
                source,
            });
        let (local_addr, listener) = listener?;

        info!(
            service = %config.name,
            bind_addr = %local_addr,
            legacy = self.handler.legacy.is_some(),
            "Service started"
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, Arc::new(self.handler), shutdown_rx));

        Ok(Service {
            config,
            local_addr,
            shutdown,
            task,
        })
    }
}

impl Service {
    /// Check the configuration against the router's live lists, then bind.
    pub async fn start(config: ServiceConfig, router: Arc<Router>) -> Result<Self, ServiceError> {
        let lists = router.lists();
        PreparedService::new(config, &lists, router)?.bind().await
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and release the port. Open connections keep running.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(service = %self.config.name, error = %e, "Accept loop panicked");
        }
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<Handler>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(service = %handler.config.name, "Service stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let metadata = Metadata::new(handler.config.name.clone(), peer_addr)
                        .with_destination(handler.config.target_address.clone(), handler.config.target_port);
                    let span = tracing::info_span!(
                        "connection",
                        id = %metadata.id,
                        service = %handler.config.name,
                    );
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move { handler.handle(stream, metadata).await }.instrument(span));
                }
                Err(e) => {
                    error!(service = %handler.config.name, error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

impl Handler {
    async fn handle(&self, stream: TcpStream, mut metadata: Metadata) {
        let mode = self.config.ip_access.mode;
        let ip = metadata.source.ip().to_string();
        if mode.is_enabled() && !check_access(self.ip_lists.iter().map(|list| &**list), mode, &ip) {
            let conn = CachedStream::new(stream);
            if let Err(e) = builtin::reset(&conn) {
                debug!(error = %e, "Failed to arm reset");
            }
            warn!(ip = %ip, "Rejected by IP access control");
            return;
        }

        info!(peer_addr = %metadata.source, "New inbound connection");
        let mut conn = CachedStream::new(stream);

        if self.config.enable_proxy_protocol {
            match read_header(&mut conn, DEFAULT_READ_TIMEOUT).await {
                Ok(header) => match (header.command, header.source) {
                    (Command::Proxy, Some(source)) if !header.transport.is_unspec() => {
                        debug!(source = %source, "Client address from PROXY header");
                        metadata.set_source(source);
                    }
                    _ => debug!(command = ?header.command, "PROXY header carries no client address"),
                },
                Err(ProxyProtocolError::NotProxyProtocol) => conn.rewind(0),
                Err(e) => {
                    warn!(error = %e, "Failed to read PROXY header");
                    return;
                }
            }
        }

        match &self.legacy {
            Some(outbound) => serve_legacy(outbound, conn, metadata).await,
            None => self.router.handle_connection(conn, metadata).await,
        }
    }
}

async fn serve_legacy(outbound: &MinecraftOutbound, mut conn: ClientConn, mut metadata: Metadata) {
    if let Err(e) = sniff_handshake(&mut conn, &mut metadata, SNIFF_STEP_TIMEOUT).await {
        warn!(error = %e, "Error when reading Minecraft handshake");
        return;
    }
    if let Err(e) = outbound.inject(&mut conn, &mut metadata).await {
        warn!(outbound = %outbound.name(), error = %e, "Outbound connection failed");
    }
}
