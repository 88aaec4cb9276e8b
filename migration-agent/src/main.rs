//! Migration agent entry point.
//!
//! Loads configuration, initializes logging, and fixes the process-wide
//! migration slot capacity before any driver can run. The agent itself is a
//! library of collaborator traits and a driver — something out of scope
//! here (a peer RPC listener, a local control socket, whatever embeds this
//! crate) is responsible for constructing `MigrationDriver`s against real
//! collaborators and routing requests to them.

use migration_agent::config::AgentConfig;
use migration_agent::migration::MigrationSlot;

#[tokio::main]
async fn main() {
    let config = AgentConfig::load();

    if let Err(err) = config.validate() {
        eprintln!("invalid configuration: {err}");
        std::process::exit(1);
    }

    if let Err(err) = config.logging.init() {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }

    if let Err(err) = MigrationSlot::set_capacity(config.migration.max_outgoing_migrations) {
        tracing::warn!(%err, "migration slot capacity already initialized, using the default");
    }

    tracing::info!(
        max_outgoing_migrations = config.migration.max_outgoing_migrations,
        downtime_ms = config.migration.downtime_ms,
        ssl = config.migration.ssl,
        control_port = config.migration.control_port,
        "migration agent started"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
        std::process::exit(1);
    }

    tracing::info!("shutdown signal received, exiting");
}
