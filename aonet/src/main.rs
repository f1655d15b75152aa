//! aonet — the AoNET server binary.
//!
//! Wires `aonet-core`'s configuration loading and accept loop together
//! with `aonet-tunnel`'s public-reachability supervisor, CLI overrides
//! via `clap`, and `env_logger` initialization: a thin `#[tokio::main]`
//! entry point delegating to a `run()` that returns
//! `Result<(), Box<dyn Error>>`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use aonet_core::{Server, ServerConfig};
use aonet_tunnel::Supervisor;

/// AoNET chat server.
#[derive(Parser, Debug)]
#[command(name = "aonet", version, about)]
struct Cli {
    /// Path to the YAML config file (defaults to ~/.aonet/config.yaml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the max authenticated-connection count.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Public relay host:port for the bore tunnel helper.
    #[arg(long, default_value = "bore.pub")]
    bore_server: String,

    /// Disable the public-reachability tunnel entirely.
    #[arg(long)]
    no_tunnel: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// Translate the config's `log_level` into the default `RUST_LOG` filter,
/// letting an operator-set `RUST_LOG` win if present.
fn init_logging(log_level: &str) {
    if std::env::var("RUST_LOG").is_err() {
        let level = log_level.to_lowercase();
        // SAFETY: called once, before any other thread is spawned.
        unsafe {
            std::env::set_var(
                "RUST_LOG",
                format!("aonet={level},aonet_core={level},aonet_tunnel={level}"),
            );
        }
    }
    env_logger::init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(ServerConfig::default_path)
        .ok_or("could not determine a default config path; pass --config")?;

    let mut config = ServerConfig::load_or_default(&config_path)?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(max_connections) = cli.max_connections {
        config.max_connections = max_connections;
    }

    init_logging(&config.log_level);

    log::info!(
        "config loaded from {}: host={} port={} max_connections={}",
        config_path.display(),
        config.host,
        config.port,
        config.max_connections
    );

    let server = Arc::new(Server::new(config.clone()));

    let tunnel = if cli.no_tunnel {
        None
    } else {
        let supervisor = Arc::new(
            Supervisor::new(config.port, cli.bore_server)
                .on_connected(|url| log::info!("public URL: {url}"))
                .on_disconnected(|| log::warn!("tunnel disconnected"))
                .on_url_change(|url| log::warn!("public URL changed: {url}")),
        );
        match supervisor.start().await {
            Ok(url) => log::info!("tunnel established at {url}"),
            Err(e) => log::error!("failed to start tunnel: {e}"),
        }
        Some(supervisor)
    };

    let result = server.run().await;

    if let Some(tunnel) = tunnel {
        tunnel.stop().await;
    }

    result.map_err(|e| e.into())
}
