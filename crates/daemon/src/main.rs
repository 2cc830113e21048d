//! Nimbus daemon
//!
//! Provisions VPS instances, bootstraps their runtime, automates domain
//! certificates and bridges remote shells over one HTTP port.

use clap::Parser;
use nimbus_daemon::config::{DaemonConfig, Secrets};
use nimbus_daemon::state::StateManager;
use nimbus_daemon::{server, Backends, Daemon};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "nimbusd")]
#[command(about = "Nimbus daemon - VPS provisioning, certificates and web terminals")]
#[command(version)]
struct Cli {
    /// Configuration file path [default: ~/.nimbus/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print a 24h API token for USER and exit
    #[arg(long, value_name = "USER")]
    print_token: Option<String>,
}

fn init_logging(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);

    info!("Nimbus daemon v{}", nimbus_common::VERSION);

    let config_path = cli
        .config
        .unwrap_or_else(nimbus_common::default_config_path);
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    config.validate()?;

    let secrets = Secrets::from_env()?;
    info!(?secrets, "Loaded secrets from environment");

    if let Some(user) = cli.print_token {
        let auth = nimbus_daemon::auth::JwtAuth::new(&secrets.jwt_secret)?;
        println!("{}", auth.issue(&user, Duration::from_secs(24 * 3600))?);
        return Ok(());
    }

    tokio::fs::create_dir_all(&config.store_path).await?;
    let state = StateManager::open(&config.db_path(), &secrets.sealing_key)?;
    let backends = Backends::from_config(&config, &secrets)?;
    let listen = config.listen.clone();
    let daemon = Arc::new(Daemon::new(config, state, backends, &secrets.jwt_secret)?);

    let background = daemon.start_background()?;

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    let server_handle = tokio::spawn(server::serve(daemon.clone(), listener));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    daemon.shutdown().await;
    for handle in background {
        let _ = handle.await;
    }

    info!("Daemon shutdown complete");
    Ok(())
}
