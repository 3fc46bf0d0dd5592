//! simple-tunnel-server: the tunnel server binary
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path and port
//! simple-tunnel-server
//!
//! # Run with a custom configuration and port
//! simple-tunnel-server -c /path/to/config.json -p 7788
//!
//! # Validate the configuration and exit
//! simple-tunnel-server -c /path/to/config.json --check
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use simple_tunnel::discovery::{SERVICE_DOMAIN, SERVICE_TYPE};
use simple_tunnel::{close_all_tunnels, load_config, TunnelServer};

const DEFAULT_CONFIG_PATH: &str = "/etc/simple-tunnel/config.json";
const DEFAULT_PORT: u16 = 7788;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Port to listen on
    port: u16,
    /// Validate the configuration and exit
    check_config: bool,
}

impl Args {
    fn parse() -> Option<Self> {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        let mut port = DEFAULT_PORT;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    config_path = PathBuf::from(args.next()?);
                }
                "-p" | "--port" => {
                    port = args.next()?.parse().ok()?;
                }
                "--check" => check_config = true,
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    return None;
                }
            }
        }

        Some(Self {
            config_path,
            port,
            check_config,
        })
    }
}

fn print_usage() {
    println!(
        "Usage: simple-tunnel-server [OPTIONS]\n\
         \n\
         Options:\n\
         \x20 -c, --config <PATH>  Configuration file (default: {DEFAULT_CONFIG_PATH})\n\
         \x20 -p, --port <PORT>    Port to listen on (default: {DEFAULT_PORT})\n\
         \x20     --check          Validate the configuration and exit\n\
         \x20 -h, --help           Show this help"
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(args) = Args::parse() else {
        print_usage();
        return ExitCode::FAILURE;
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args.config_path)
        .with_context(|| format!("failed to load {}", args.config_path.display()))?;

    if args.check_config {
        info!("Configuration OK");
        return Ok(());
    }

    let server = Arc::new(TunnelServer::new(config)?);
    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;

    info!(
        "simple-tunnel-server {} advertising as {}.{} on port {}",
        simple_tunnel::VERSION,
        SERVICE_TYPE,
        SERVICE_DOMAIN,
        args.port
    );

    tokio::select! {
        result = server.run(listener) => {
            result.context("listener failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown requested, closing all tunnels");
            close_all_tunnels();
        }
    }

    Ok(())
}
