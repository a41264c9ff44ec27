use anyhow::{Result, bail};
use clap::ArgMatches;

use onfocus_api::health::{HealthService, HealthStatus};
use onfocus_api::{AppConfig, ConnectionPool};

pub async fn handle_status(matches: &ArgMatches, config: AppConfig) -> Result<()> {
    let verbose = matches.get_flag("verbose");

    println!("🔍 OnFocus API Status");
    println!("=====================\n");
    println!("Environment: {}", config.environment);
    println!(
        "Database:    {}@{}:{}/{}",
        config.database.user, config.database.host, config.database.port, config.database.database
    );

    let pool = ConnectionPool::connect(&config.database, config.pool.clone())?;
    let health = HealthService::new(pool.clone(), config.environment);
    let database = health.check_database().await;

    match database.status {
        HealthStatus::Unhealthy => println!("\n  ❌ MySQL unreachable"),
        HealthStatus::Degraded => println!(
            "\n  ⚠️  MySQL reachable but degraded: {}",
            database.message.as_deref().unwrap_or("unknown reason")
        ),
        HealthStatus::Healthy => println!("\n  ✅ MySQL reachable ({} ms)", database.latency_ms),
    }

    if verbose {
        let pool_health = &database.connection_pool;
        println!("\n📊 Connection Pool");
        println!("  active:  {}", pool_health.active);
        println!("  idle:    {}", pool_health.idle);
        println!("  max:     {}", pool_health.max);
        println!("  waiting: {}", pool_health.waiting);
        println!(
            "  acquire timeout: {:?}, queue limit: {}",
            pool.config().acquire_timeout(),
            match pool.config().queue_limit {
                0 => "unbounded".to_string(),
                n => n.to_string(),
            }
        );
    }

    pool.close().await?;

    if database.status == HealthStatus::Unhealthy {
        bail!("database health check failed");
    }
    println!("\n✅ Status check complete");
    Ok(())
}
