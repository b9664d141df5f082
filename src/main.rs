//! burrow: a memcached-compatible cache server
//!
//! An event-driven, non-blocking server over an ordered in-memory store:
//! - Memcached text protocol (get, gets, set, add, replace, append, prepend,
//!   cas, delete, incr, decr, stats, flush_all, version)
//! - Per-connection state machine with pipelining and back-pressure
//! - Automatic key expiration and memory capping
//! - Configuration via CLI arguments or TOML file

mod backend;
mod config;
mod conn;
mod protocol;
mod reactor;
mod server;
mod store;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_memory_mb = config.max_memory / 1024 / 1024,
        default_ttl = config.default_ttl,
        "Starting burrow server"
    );

    server::run(config)?;

    Ok(())
}
