//! conn-dispatch server binary.

use conn_dispatch::config::Config;
use conn_dispatch::dispatch;
use conn_dispatch::server::Server;
use std::net::TcpStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        strategy = ?config.strategy,
        pool_size = config.pool_size,
        queue_capacity = ?config.queue_capacity,
        queue_policy = ?config.queue_policy,
        read_timeout = ?config.read_timeout,
        "Starting conn-dispatch server"
    );

    let dispatcher = dispatch::build::<TcpStream>(&config)?;
    let server = Server::bind(&config, dispatcher)?;
    info!(address = %server.local_addr(), "Accepting connections");

    if let Err(e) = server.run() {
        error!(error = %e, "Server terminated");
        return Err(e.into());
    }
    Ok(())
}
