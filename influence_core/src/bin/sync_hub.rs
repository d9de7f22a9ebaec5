use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use influence_core::{load_sync_config, load_sync_config_from_env, start_relay_server_with_timeout};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay for NPC influence synchronization", long_about = None)]
struct Cli {
    /// Address to listen on. Defaults to `relay_bind` from the config.
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Sync config file. Overrides INFLUENCE_SYNC_CONFIG_PATH.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Seconds between connection count reports.
    #[arg(long, default_value_t = 30)]
    status_interval: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let (config, config_path) = match cli.config.as_deref() {
        Some(path) => load_sync_config(Some(path)),
        None => load_sync_config_from_env(),
    };
    let bind = cli.bind.unwrap_or(config.relay_bind);

    let Some(relay) = start_relay_server_with_timeout(bind, config.relay_write_timeout()) else {
        error!(target: "influence_sync::relay", %bind, "sync_hub.start_failed");
        return ExitCode::FAILURE;
    };

    info!(
        target: "influence_sync::relay",
        addr = %relay.local_addr(),
        config = ?config_path,
        "sync_hub ready"
    );

    let interval = Duration::from_secs(cli.status_interval.max(1));
    loop {
        thread::sleep(interval);
        info!(
            target: "influence_sync::relay",
            clients = relay.client_count(),
            "sync_hub.status"
        );
    }
}
