//! Database pool setup, migrations and health checks.
//!
//! Postgres in production; any SeaORM-supported URL works, which is how the
//! tests run against `sqlite::memory:`.

use std::time::Duration;

use anyhow::{Context, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use sea_orm_migration::MigratorTrait;
use tokio::time::sleep;

use crate::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

const CONNECT_ATTEMPTS: u32 = 5;

/// Opens the connection pool, retrying transient connect failures with
/// exponential backoff.
///
/// ```no_run
/// use marketplace_sync::{config::AppConfig, db::init_pool};
///
/// # async fn run() -> anyhow::Result<()> {
/// let db = init_pool(&AppConfig::default()).await?;
/// # let _ = db;
/// # Ok(())
/// # }
/// ```
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    if cfg.database_url.trim().is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "database URL cannot be empty".to_string(),
        }
        .into());
    }

    let mut opt = ConnectOptions::new(&cfg.database_url);
    opt.max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let mut retry_delay = Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                log::info!("connected to database (attempt {attempt})");
                return Ok(conn);
            }
            Err(err) if attempt >= CONNECT_ATTEMPTS => {
                log::error!("giving up on database after {attempt} attempts: {err}");
                return Err(DatabaseError::ConnectionFailed { source: err }.into());
            }
            Err(err) => {
                log::warn!("database connection attempt {attempt} failed: {err}; retrying in {retry_delay:?}");
                sleep(retry_delay).await;
                retry_delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// Applies all pending migrations.
pub async fn run_migrations(db: &DatabaseConnection) -> Result<()> {
    migration::Migrator::up(db, None)
        .await
        .context("failed to apply database migrations")?;
    log::info!("database migrations applied");
    Ok(())
}

/// Executes `SELECT 1` against the pool.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt)
        .await
        .context("database health check failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_database_url_is_rejected() {
        let config = AppConfig {
            database_url: " ".to_string(),
            ..Default::default()
        };

        let result = init_pool(&config).await;
        assert!(matches!(
            result.unwrap_err().downcast::<DatabaseError>(),
            Ok(DatabaseError::InvalidConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn sqlite_memory_pool_passes_health_check_after_migrations() {
        let config = AppConfig {
            database_url: "sqlite::memory:".to_string(),
            db_max_connections: 1,
            ..Default::default()
        };

        let db = init_pool(&config).await.unwrap();
        run_migrations(&db).await.unwrap();
        health_check(&db).await.unwrap();
    }
}
