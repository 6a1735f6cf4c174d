//! pingwatch: peer liveness monitor.
//!
//! Listens for ICMP echo requests from configured peers and posts a webhook
//! event whenever a peer is confirmed up or down.

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pingwatch_core::{Config, Monitor, MonitorSettings, PeerRegistry};
use pingwatch_daemon::{IcmpListener, WebhookNotifier};

#[derive(Parser, Debug)]
#[command(name = "pingwatch")]
#[command(about = "Peer liveness monitor driven by inbound ICMP echo requests")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// IPv4 address to accept echo requests on
    #[arg(short, long, default_value = "0.0.0.0")]
    listen: Ipv4Addr,

    /// Log packet matches and report every state change
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,pingwatch=debug"
    } else {
        "info,pingwatch=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting pingwatch");
    info!("Config path: {:?}", args.config);

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    config.validate().context("Invalid configuration")?;
    let settings = MonitorSettings::from_config(&config, args.verbose)?;
    let registry = PeerRegistry::from_config(&config).context("Failed to load peers")?;

    let (notifier, worker) = WebhookNotifier::new()
        .context("Failed to create HTTP client")?
        .spawn();
    let monitor = Monitor::new(settings, registry, notifier);

    let listener = IcmpListener::bind(args.listen)
        .with_context(|| format!("Failed to listen on ip4:icmp:{}", args.listen))?;
    info!("listening on ip4:icmp:{}", listener.local_addr());

    let handle = monitor.handle();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(name) => info!("{} received", name),
            Err(e) => {
                error!("Failed to wait for shutdown signal: {}", e);
                return;
            }
        }
        if let Err(e) = handle.close() {
            warn!("Failed to close monitor: {}", e);
        }
    });

    let result = monitor.listen(listener).await;

    // The monitor dropped the last sender; the worker exits on its own
    if let Err(e) = worker.await {
        warn!("Webhook worker ended abnormally: {}", e);
    }
    result.context("Monitor stopped")?;

    info!("Shutting down");
    Ok(())
}

/// Wait for SIGHUP, SIGINT, SIGTERM or SIGQUIT and return its name.
#[cfg(unix)]
async fn shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = hangup.recv() => "SIGHUP",
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
