//! Postgres pool construction and schema migrations

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

use crate::error::LoopError;

/// Pool sizing and timeout knobs. Defaults suit a small billing service
/// behind PgBouncer; each field can be overridden through `DATABASE_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl PoolConfig {
    /// Defaults overlaid with `DATABASE_MAX_CONNECTIONS`,
    /// `DATABASE_MIN_CONNECTIONS` and `DATABASE_ACQUIRE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_connections: env_u64(
                "DATABASE_MAX_CONNECTIONS",
                u64::from(defaults.max_connections),
            ) as u32,
            min_connections: env_u64(
                "DATABASE_MIN_CONNECTIONS",
                u64::from(defaults.min_connections),
            ) as u32,
            acquire_timeout: Duration::from_secs(env_u64(
                "DATABASE_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )),
            ..defaults
        }
    }
}

/// Connect with environment-driven sizing.
pub async fn create_pool(database_url: &str) -> Result<PgPool, LoopError> {
    create_pool_with(database_url, PoolConfig::from_env()).await
}

/// Connect with explicit sizing.
pub async fn create_pool_with(
    database_url: &str,
    config: PoolConfig,
) -> Result<PgPool, LoopError> {
    // PgBouncer in transaction mode cannot serve prepared statements
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), LoopError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_env_overrides() {
        std::env::set_var("DATABASE_MAX_CONNECTIONS", "3");
        let config = PoolConfig::from_env();
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.min_connections, PoolConfig::default().min_connections);
        std::env::remove_var("DATABASE_MAX_CONNECTIONS");
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_create_pool() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url).await.expect("Failed to create pool");
        assert!(pool.size() > 0);
    }
}
