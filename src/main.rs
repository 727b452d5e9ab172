//! milter-transport: runs a milter transport server with the echo
//! dispatcher.
//!
//! Usage: `milter-transport [PORT] [--runtime reactor|threaded] [--config FILE]`

use milter_transport::config::Config;
use milter_transport::protocols::echo::EchoFactory;
use milter_transport::Server;
use tracing::info;
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
        listen = %config.listener.target,
        runtime = ?config.runtime,
        backlog = config.listener.backlog,
        max_frame_len = config.listener.max_frame_len,
        max_connections = config.listener.max_connections,
        "Starting milter transport"
    );

    let server = Server::bind(config.runtime, config.listener, EchoFactory, ())?;
    server.serve()?;
    Ok(())
}
