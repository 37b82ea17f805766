//! A running gateway: one router shared by every service.
//!
//! Start order is router, then services. A reload validates the new router
//! and every changed service before it swaps anything; services whose
//! configuration is unchanged keep their listeners.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use craftgate_networking::{BufferPool, StringSet};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{Root, ServiceConfig};
use crate::proxy::listener::{PreparedService, Service};
use crate::proxy::outbound::SystemDialer;
use crate::proxy::router::{Router, RouterOptions};
use crate::proxy::rules::ListMap;

/// Quiet period after a file event before the document is read.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

/// What asked for a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    Signal,
    FileChanged,
}

impl ReloadTrigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Signal => "SIGHUP",
            Self::FileChanged => "watch",
        }
    }
}

pub struct Instance {
    router: Arc<Router>,
    services: Vec<Service>,
    lists: HashMap<String, StringSet>,
}

impl Instance {
    /// Build the router and start every service.
    pub async fn start(root: &Root) -> Result<Self> {
        let router = Arc::new(Router::new(
            Arc::new(SystemDialer::default()),
            Arc::new(BufferPool::with_defaults()),
        ));
        Self::start_with_router(root, router).await
    }

    /// Like [`Instance::start`] with a caller-built router, e.g. one with
    /// custom rules or sniffers registered.
    pub async fn start_with_router(root: &Root, router: Arc<Router>) -> Result<Self> {
        check_service_names(&root.services)?;
        let snapshot = router
            .prepare(&RouterOptions::from(root))
            .context("Failed to build router")?;
        let prepared = prepare_services(&root.services, snapshot.lists(), &router)?;
        router.commit(snapshot);

        let mut services = Vec::with_capacity(prepared.len());
        for service in prepared {
            services.push(service.bind().await?);
        }

        info!(services = services.len(), "Instance started");
        Ok(Self {
            router,
            services,
            lists: root.lists.clone(),
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Bound address of the named service.
    pub fn service_addr(&self, name: &str) -> Option<SocketAddr> {
        self.services
            .iter()
            .find(|service| service.name() == name)
            .map(Service::local_addr)
    }

    /// Apply a new configuration document.
    ///
    /// The router generation and every service that has to be (re)started
    /// are built first; any configuration error leaves the running
    /// instance untouched. Only then is the router swapped and are changed
    /// services rebound. A listener that cannot be bound is reported and
    /// stays down.
    pub async fn reload(&mut self, root: &Root) -> Result<()> {
        check_service_names(&root.services)?;
        let snapshot = self
            .router
            .prepare(&RouterOptions::from(root))
            .context("Failed to apply router configuration")?;

        let lists_changed = self.lists != root.lists;
        let changed: Vec<ServiceConfig> = root
            .services
            .iter()
            .filter(|config| {
                lists_changed
                    || !self
                        .services
                        .iter()
                        .any(|service| service.config() == *config)
            })
            .cloned()
            .collect();
        let prepared = prepare_services(&changed, snapshot.lists(), &self.router)?;

        self.router.commit(snapshot);
        self.lists = root.lists.clone();

        let mut keep = Vec::with_capacity(root.services.len());
        for service in std::mem::take(&mut self.services) {
            if changed.iter().any(|config| config.name == service.name())
                || !root.services.iter().any(|config| config.name == service.name())
            {
                debug!(service = %service.name(), "Stopping service");
                service.stop().await;
            } else {
                keep.push(service);
            }
        }
        self.services = keep;

        let mut failures = Vec::new();
        for service in prepared {
            let name = service.name().to_string();
            match service.bind().await {
                Ok(service) => self.services.push(service),
                Err(e) => {
                    error!(service = %name, error = %e, "Failed to start service");
                    failures.push(e.to_string());
                }
            }
        }

        if !failures.is_empty() {
            bail!("Failed to start services: {}", failures.join("; "));
        }
        info!(services = self.services.len(), "Configuration reloaded");
        Ok(())
    }

    /// Stop every service. Established relays finish on their own.
    pub async fn shutdown(self) {
        for service in self.services {
            service.stop().await;
        }
        info!("Instance stopped");
    }

    /// Serve until `shutdown` resolves, reloading `path` on SIGHUP and,
    /// when `watch` is set, whenever the file changes.
    pub async fn run(mut self, path: PathBuf, watch: bool, shutdown: impl Future<Output = ()>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(1);
        spawn_signal_listener(tx.clone());
        let _watcher = if watch {
            Some(watch_file(&path, tx).context("Failed to watch configuration file")?)
        } else {
            drop(tx);
            None
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                trigger = rx.recv() => {
                    let Some(trigger) = trigger else { break };
                    if trigger == ReloadTrigger::FileChanged {
                        tokio::time::sleep(WATCH_DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}
                    }
                    self.reload_from(&path, trigger).await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn reload_from(&mut self, path: &Path, trigger: ReloadTrigger) {
        info!(source = trigger.as_str(), path = %path.display(), "Reloading configuration");
        let result = match Root::load(path) {
            Ok(root) => self.reload(&root).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(source = trigger.as_str(), error = %format!("{e:#}"), "Reload failed");
        }
    }
}

/// Check every service against `lists` before anything is bound.
fn prepare_services(
    configs: &[ServiceConfig],
    lists: &ListMap,
    router: &Arc<Router>,
) -> Result<Vec<PreparedService>> {
    configs
        .iter()
        .map(|config| {
            PreparedService::new(config.clone(), lists, Arc::clone(router))
                .with_context(|| format!("Invalid service {}", config.name))
        })
        .collect()
}

fn check_service_names(services: &[ServiceConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for service in services {
        if !seen.insert(service.name.as_str()) {
            bail!("Duplicate service name: {}", service.name);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_listener(tx: mpsc::Sender<ReloadTrigger>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Failed to register SIGHUP handler");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            if tx.send(ReloadTrigger::Signal).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(_tx: mpsc::Sender<ReloadTrigger>) {}

/// Watch the directory holding `path` so editors that replace the file are
/// noticed too.
fn watch_file(path: &Path, tx: mpsc::Sender<ReloadTrigger>) -> notify::Result<RecommendedWatcher> {
    let file_name = path.file_name().map(|name| name.to_os_string());
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            let ours = event
                .paths
                .iter()
                .any(|changed| changed.file_name().map(|name| name.to_os_string()) == file_name);
            if ours {
                // A full channel already has a reload queued.
                let _ = tx.try_send(ReloadTrigger::FileChanged);
            }
        }
        Err(e) => warn!(error = %e, "Configuration watcher error"),
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "Watching configuration file");
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_service_names() {
        let service = ServiceConfig {
            name: "mc".to_string(),
            ..ServiceConfig::default()
        };
        assert!(check_service_names(&[service.clone()]).is_ok());
        assert!(check_service_names(&[service.clone(), service]).is_err());
    }

    #[test]
    fn test_trigger_names() {
        assert_eq!(ReloadTrigger::Signal.as_str(), "SIGHUP");
        assert_eq!(ReloadTrigger::FileChanged.as_str(), "watch");
    }
}
