//! WD My Cloud Hardware Controller Daemon (wdhwd)
//!
//! Standalone service that:
//! - Owns the serial link to the PMC microcontroller
//! - Governs the chassis fan from board and disk temperatures
//! - Tracks drive bays, power sockets, buttons, LCD and LEDs
//! - Exposes a local unix-socket IPC endpoint for clients
//!
//! Usage: wdhwd [config-file]
//! Default config: /etc/wdhwd/wdhwd.json
//! Default IPC socket: /run/wdhwd/hws.sock

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wdhwd::config::Config;
use wdhwd::runtime;

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("wdhwd: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config) {
        eprintln!("wdhwd: {}", e);
        std::process::exit(1);
    }

    info!("Starting WD My Cloud Hardware Controller Daemon (wdhwd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PMC port: {}", config.pmc_port.display());
    info!("IPC socket: {}", config.socket_path.display());

    match runtime::run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("startup failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Initialize tracing with the configured filter, to stderr or the
/// configured log file.
fn init_tracing(config: &Config) -> std::io::Result<()> {
    // The filter comes from configuration alone; the daemon reads no
    // environment beyond RUNTIME_DIRECTORY.
    let filter = EnvFilter::new(&config.logging);

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true))
                .with(filter)
                .init();
        }
    }
    Ok(())
}
