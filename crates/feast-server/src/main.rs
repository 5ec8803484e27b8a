//! Memory Feast server binary.
//!
//! Configuration comes from the environment:
//!
//! | Variable                   | Effect                                   |
//! |----------------------------|------------------------------------------|
//! | `FEAST_BIND`               | listen address, e.g. `0.0.0.0:8080`      |
//! | `PORT`                     | listen on `0.0.0.0:$PORT` (if no bind)   |
//! | `FEAST_GRACE_SECS`         | reconnect grace period                   |
//! | `FEAST_TURN_SECS`          | matching turn time limit                 |
//! | `FEAST_QUEUE_TIMEOUT_SECS` | matchmaking queue timeout                |
//! | `ALLOWED_WS_ORIGINS`       | comma-separated browser origins          |
//! |                            | (default: localhost pages only)          |
//! | `RUST_LOG`                 | log filter (default `info,feast=debug`)  |

use std::sync::Arc;
use std::time::Duration;

use feast::prelude::*;
use tracing_subscriber::EnvFilter;

const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,feast=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

fn env_secs(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring non-numeric override");
            None
        }
    }
}

/// Applies environment overrides on top of the defaults.
fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();

    if let Ok(bind) = std::env::var("FEAST_BIND") {
        config.bind_addr = bind;
    } else if let Ok(port) = std::env::var("PORT") {
        config.bind_addr = format!("0.0.0.0:{}", port.trim());
    }
    if let Some(secs) = env_secs("FEAST_GRACE_SECS") {
        config.reconnect_grace = Duration::from_secs(secs);
    }
    if let Some(secs) = env_secs("FEAST_TURN_SECS") {
        config.room.turn_time_limit = u32::try_from(secs.max(1)).unwrap_or(u32::MAX);
    }
    if let Some(secs) = env_secs("FEAST_QUEUE_TIMEOUT_SECS") {
        config.queue.timeout = Duration::from_secs(secs);
    }
    if let Ok(origins) = std::env::var("ALLOWED_WS_ORIGINS") {
        config.allowed_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_owned)
            .collect();
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = config_from_env();
    tracing::info!(
        addr = %config.bind_addr,
        grace_secs = config.reconnect_grace.as_secs(),
        turn_secs = config.room.turn_time_limit,
        origins = ?config.allowed_origins,
        "starting Memory Feast server"
    );

    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let purger = Arc::clone(&store);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            purger.purge_expired();
        }
    });

    let server = FeastServer::<MemoryStore>::builder().config(config).build(store).await?;
    server.run().await?;
    Ok(())
}
