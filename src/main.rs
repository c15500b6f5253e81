//! TlsProxy - Main entry point
//!
//! A dual-listener TLS-terminating reverse proxy

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tlsproxy::{config::default_config_dir, ProxyConfig, ProxyServer};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// TlsProxy - A dual-listener TLS-terminating reverse proxy
#[derive(Parser, Debug)]
#[command(name = "tlsproxy")]
#[command(author = "TlsProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Terminates TLS on 8443/443 and forwards plaintext to 8000/80")]
struct Args {
    /// IP address to bind the TLS listeners to; also the upstream host.
    /// When absent the proxy exits without binding anything.
    #[arg(env = "BIND_IP")]
    bind_ip: Option<String>,

    /// Directory containing cert.pem and key.pem
    #[arg(long, env = "CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Grace period in seconds for draining sessions on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE", default_value = "30")]
    shutdown_grace: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    // No bind ip is a guarded no-op, not an error: the proxy is simply not
    // wanted on this host.
    let bind_ip = match args.bind_ip.filter(|ip| !ip.is_empty()) {
        Some(ip) => ip,
        None => {
            info!("Exiting, no bind ip set");
            return Ok(());
        }
    };

    let bind_addr: IpAddr = bind_ip
        .parse()
        .with_context(|| format!("invalid bind ip: {}", bind_ip))?;

    let config_dir = args
        .config_dir
        .or_else(default_config_dir)
        .context("could not determine home directory for the config dir")?;

    let mut config = ProxyConfig::new(bind_addr, &config_dir);
    config.shutdown_grace = Duration::from_secs(args.shutdown_grace);
    let grace = config.shutdown_grace;

    info!("Binding to {}", bind_addr);

    let server = ProxyServer::new(config)?;
    let listeners = server.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down, draining sessions");
    for listener in &listeners {
        listener.stop();
    }

    if !server.wait_idle(grace).await {
        warn!(
            "{} session(s) still active after the grace period",
            server.active_sessions()
        );
    }

    Ok(())
}
