//! Database connection pool management.
//!
//! Initializes the MySQL pool with the configured connection limit and
//! timeouts, and runs embedded migrations. The pool size is the hard
//! ceiling on everything concurrent in this service; the job scheduler's
//! cap is clamped to it at configuration time.

use log::info;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};

use crate::config::DbSettings;
use crate::error_handling::DatabaseError;

/// Connects the pool and verifies the database is reachable.
pub async fn init_db_pool(db: &DbSettings) -> Result<MySqlPool, DatabaseError> {
    let options = MySqlConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .username(&db.user)
        .password(&db.pass)
        .database(&db.name);

    let connect = MySqlPoolOptions::new()
        .max_connections(db.pool_connection_limit)
        .acquire_timeout(db.pool_acquire_timeout)
        .connect_with(options);

    let pool = tokio::time::timeout(db.pool_connect_timeout, connect)
        .await
        .map_err(|_| DatabaseError::ConnectTimeout(db.pool_connect_timeout))??;

    info!(
        "Database pool connected to {}:{}/{} (limit {})",
        db.host, db.port, db.name, db.pool_connection_limit
    );
    Ok(pool)
}

/// Runs migrations embedded at compile time from `migrations/`.
pub async fn run_migrations(pool: &MySqlPool) -> Result<(), DatabaseError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
