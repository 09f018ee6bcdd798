//! Fleet relay: the realtime server sessions connect to.
//!
//! ```text
//! fleet-relay [BIND_ADDR]
//! ```
//!
//! Configuration comes from `FLEET_RELAY_ADDR` / `FLEET_RELAY_CAPACITY`,
//! with the bind address on the command line taking precedence.
//! `RUST_LOG` controls verbosity.

use log::{error, info};
use std::process::ExitCode;

use fleet_sync::{RealtimeServer, ServerConfig};

fn config_from_args() -> Result<ServerConfig, fleet_sync::ConfigError> {
    let mut config = ServerConfig::from_env()?;
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
        config.validate()?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match config_from_args() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid relay configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting fleet relay on {}...", config.bind_addr);
    let server = RealtimeServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down after {} connection(s), {} message(s)",
                stats.total_connections, stats.total_messages
            );
        }
    }
    ExitCode::SUCCESS
}
