use crate::config::AppConfig;
use crate::errors::ServiceError;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub type DbPool = DatabaseConnection;

/// Pool settings for the checkout store
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl DbConfig {
    /// Every pooled connection to `sqlite::memory:` opens its own empty
    /// database, so such pools are pinned to a single connection.
    fn is_in_memory(&self) -> bool {
        self.url.starts_with("sqlite::memory:") || self.url.contains("mode=memory")
    }

    fn pool_bounds(&self) -> (u32, u32) {
        if self.is_in_memory() {
            if self.max_connections > 1 {
                warn!(
                    requested = self.max_connections,
                    "in-memory SQLite database limited to one connection"
                );
            }
            return (1, 1);
        }
        let max = self.max_connections.max(1);
        (self.min_connections.min(max), max)
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// Opens the pool used by every service.
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    let (min, max) = config.pool_bounds();
    debug!(min, max, "configuring database pool");

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(max)
        .min_connections(min)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(false);

    let db_pool = Database::connect(opt).await.map_err(|e| {
        error!("Database connection establishment failed: {}", e);
        ServiceError::DatabaseError(e)
    })?;

    info!(backend = ?db_pool.get_database_backend(), max_connections = max, "database pool ready");
    Ok(db_pool)
}

pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    establish_connection_with_config(&DbConfig::from(cfg)).await
}

/// Applies the checkout schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    let start = Instant::now();
    let result = crate::migrator::Migrator::up(pool, None)
        .await
        .map_err(ServiceError::DatabaseError);

    match &result {
        Ok(()) => info!(elapsed = ?start.elapsed(), "checkout schema up to date"),
        Err(e) => error!(elapsed = ?start.elapsed(), error = %e, "checkout schema migration failed"),
    }
    result
}

/// Liveness probe used by the health endpoint.
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    pool.ping().await.map_err(ServiceError::DatabaseError)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str, min: u32, max: u32) -> DbConfig {
        DbConfig {
            url: url.to_string(),
            max_connections: max,
            min_connections: min,
            connect_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn in_memory_sqlite_uses_one_connection() {
        assert_eq!(config("sqlite::memory:", 2, 10).pool_bounds(), (1, 1));
        assert_eq!(config("sqlite://file:shop?mode=memory", 0, 4).pool_bounds(), (1, 1));
    }

    #[test]
    fn file_and_server_pools_keep_their_bounds() {
        assert_eq!(config("sqlite://checkout.db?mode=rwc", 1, 10).pool_bounds(), (1, 10));
        assert_eq!(config("postgres://localhost/shop", 20, 5).pool_bounds(), (5, 5));
        assert_eq!(config("postgres://localhost/shop", 0, 0).pool_bounds(), (0, 1));
    }
}
