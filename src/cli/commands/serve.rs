use anyhow::{Context, Result};
use clap::ArgMatches;

use onfocus_api::{AppConfig, ConnectionPool, server};

pub async fn handle_serve(matches: &ArgMatches, mut config: AppConfig) -> Result<()> {
    if let Some(host) = matches.get_one::<String>("host") {
        config.server.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }

    let pool = ConnectionPool::connect(&config.database, config.pool.clone())
        .context("failed to create connection pool")?;

    server::start_server(&config, pool)
        .await
        .context("server terminated with an error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}
