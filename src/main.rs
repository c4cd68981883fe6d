//! fox-bbs - a shared chat relay for AX.25 packet radio stations.
//!
//! This is the main binary entry point. See the `fox_bbs` library for the
//! relay itself.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fox_bbs::agwpe::AgwpeAcceptor;
use fox_bbs::config::DEFAULT_CONFIG_PATH;
use fox_bbs::constants::SHUTDOWN_WATCHDOG;
use fox_bbs::transport::tcp::TcpAcceptor;
use fox_bbs::{Config, Relay, RelaySettings};
use tokio_util::sync::CancellationToken;

// CLI
#[derive(Parser)]
#[command(name = "fox-bbs")]
#[command(version)]
#[command(about = "Multi-user chat relay for AX.25 stations via Direwolf")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Serve plain TCP connections on ADDR instead of Direwolf
    #[arg(long, value_name = "ADDR")]
    demo: Option<SocketAddr>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();

    let config = Config::load(&cli.config)?;
    log::info!(
        "Loaded configuration from {} (callsign {})",
        cli.config.display(),
        config.callsign
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(run(config, cli.demo))
}

async fn run(config: Config, demo: Option<SocketAddr>) -> Result<()> {
    let relay = Relay::new(RelaySettings::from(&config));
    let shutdown = relay.shutdown_token();
    tokio::spawn(watch_signals(shutdown.clone()));

    let serve = serve(relay, &config, demo);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => result,
        () = shutdown.cancelled() => {
            match tokio::time::timeout(SHUTDOWN_WATCHDOG, serve).await {
                Ok(result) => result,
                Err(_) => {
                    log::error!("Shutdown did not complete within {:?}, exiting", SHUTDOWN_WATCHDOG);
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Open the configured acceptor and run the relay on it.
async fn serve(relay: Relay, config: &Config, demo: Option<SocketAddr>) -> Result<()> {
    if let Some(addr) = demo {
        let acceptor = TcpAcceptor::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        log::info!("Demo mode: accepting TCP connections on {}", acceptor.local_addr()?);
        return relay.run(acceptor).await;
    }

    // Ranges were checked by Config::validate
    let port = u16::try_from(config.direwolf_port).context("Invalid Direwolf port")?;
    let radio_port = u8::try_from(config.radio_port).context("Invalid radio port")?;
    let acceptor = AgwpeAcceptor::connect(&config.direwolf_host, port, radio_port, &config.callsign)
        .await
        .context("Failed to connect to Direwolf")?;
    relay.run(acceptor).await
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {e}");
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("Received SIGINT, shutting down");
                    shutdown.cancel();
                }
                return;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::warn!("Failed to listen for SIGINT: {e}");
                    return;
                }
                log::info!("Received SIGINT, shutting down");
            }
            _ = sigterm.recv() => log::info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received SIGINT, shutting down");
        }
    }

    shutdown.cancel();
}
