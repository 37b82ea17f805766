//! craftgate
//!
//! Minecraft-aware TCP reverse proxy.
//!
//! This binary:
//! - Loads the JSON configuration document, generating a default if missing
//! - Starts one listener per configured service
//! - Routes connections by sniffed Minecraft handshake or TLS SNI
//! - Reloads on SIGHUP and, with `--watch`, when the document changes

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use craftgate_gateway::{Cli, Instance, Root};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = Root::load_or_generate(&cli.config)?;

    // RUST_LOG wins, then --log-level, then the document.
    let level = cli.log_level.clone().unwrap_or_else(|| root.log.level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        services = root.services.len(),
        outbounds = root.outbounds.len(),
        rules = root.router.rules.len(),
        watch = cli.watch,
        "Starting craftgate"
    );

    let instance = match Instance::start(&root).await {
        Ok(instance) => instance,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Failed to start");
            return Err(e);
        }
    };

    instance
        .run(cli.config, cli.watch, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
}
