//! dnsproxy - encrypted DNS-over-TCP tunnel
//!
//! Client mode answers local DNS queries through the tunnel; server mode
//! terminates tunnels and forwards queries to an upstream resolver.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use dnsproxy::{Application, Client, Configuration, Server};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built ",
    env!("BUILD_DATE"),
    ", git ",
    env!("GIT_HASH"),
    ")"
);

#[derive(Parser)]
#[command(name = "dnsproxy")]
#[command(author = "Sina Rabbani")]
#[command(version = VERSION)]
#[command(about = "Encrypted DNS-over-TCP tunnel", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a client (local DNS listener)
    Client {
        /// Tunnel server address
        #[arg(short, long, env = "DNSPROXY_SERVER")]
        server: Option<String>,

        /// Tunnel server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Local DNS listen address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Delay before reconnecting after a failed tunnel (e.g. "1s", "500ms")
        #[arg(long, value_parser = parse_duration)]
        reconnect_delay: Option<Duration>,
    },

    /// Run as a server (tunnel endpoint)
    Server {
        /// Tunnel listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Upstream DNS resolver address
        #[arg(short, long)]
        dns: Option<IpAddr>,

        /// Upstream session idle timeout (e.g. "5s")
        #[arg(long, value_parser = parse_duration)]
        idle_timeout: Option<Duration>,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Configuration::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Configuration::default(),
    };
    config.verbose |= cli.verbose;

    // Initialize logger
    let level = if config.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match cli.command {
        Commands::Client {
            server,
            port,
            bind,
            reconnect_delay,
        } => {
            if let Some(server) = server {
                config.server_address = Some(server);
            }
            if let Some(port) = port {
                config.server_port = port;
            }
            if let Some(bind) = bind {
                config.local_dns_bind = bind;
            }
            if let Some(delay) = reconnect_delay {
                config.reconnect_delay = delay;
            }

            let client = Client::new(config).context("Invalid client configuration")?;
            run(client).await
        }
        Commands::Server {
            port,
            dns,
            idle_timeout,
        } => {
            if let Some(port) = port {
                config.server_port = port;
            }
            if let Some(dns) = dns {
                config.dns_provider_address = dns;
            }
            if let Some(idle) = idle_timeout {
                config.session_idle_timeout = idle;
            }

            let server = Server::new(config).context("Invalid server configuration")?;
            run(server).await
        }
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run<A: Application>(app: A) -> Result<()> {
    info!("dnsproxy {}", VERSION);
    app.start().await.context("Failed to start")?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");

    app.stop().await;
    app.destroy().await;
    Ok(())
}
