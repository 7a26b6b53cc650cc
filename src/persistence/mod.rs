//! Persistence Layer
//!
//! Durable, restart-safe storage on SQLite with async operations via sqlx.
//! Five tables back the controller core:
//!
//! - `state`: one row per symbol (cooldown, last entry/protective ids)
//! - `orders`: every broker order ever observed, upserted by `order_id`;
//!   closed orders are never deleted
//! - `fills`: one immutable row per execution, keyed by `exec_id`
//! - `events`: append-only audit log
//! - `performance_snapshots`: daily account snapshots
//!
//! Monetary values are stored as TEXT so decimal precision survives the
//! round trip. Every mutation that changes observable state commits in the
//! same transaction as its audit event.

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization and query errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

/// Initialize the database connection pool and run migrations.
///
/// # Arguments
/// - `database_url`: SQLite URL (e.g., "sqlite://data/trailbot.db", or
///   "sqlite::memory:" in tests)
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    // Ensure the data directory exists
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // An in-memory database exists per connection; keep the pool at one
    // connection so every handle sees the same schema.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS state (
            symbol TEXT PRIMARY KEY,
            cooldown_until DATETIME,
            last_parent_id TEXT,
            last_trail_id TEXT,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create state table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            order_id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('BUY', 'SELL')),
            order_type TEXT NOT NULL,
            status TEXT NOT NULL,
            qty TEXT NOT NULL,
            filled_qty TEXT NOT NULL DEFAULT '0',
            filled_avg_price TEXT,
            stop_price TEXT,
            limit_price TEXT,
            trailing_pct TEXT,
            parent_id TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create orders table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fills (
            exec_id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('BUY', 'SELL')),
            qty TEXT NOT NULL,
            price TEXT NOT NULL,
            ts DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create fills table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            symbol TEXT,
            payload_json TEXT,
            ts DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create events table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS performance_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date DATETIME NOT NULL,
            account_value TEXT,
            cash_value TEXT,
            position_value TEXT,
            unrealized_pnl TEXT,
            realized_pnl TEXT,
            daily_pnl TEXT,
            num_positions INTEGER NOT NULL DEFAULT 0,
            num_trades INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!(
            "Failed to create performance_snapshots table: {}",
            e
        ))
    })?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol)",
        "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
        "CREATE INDEX IF NOT EXISTS idx_fills_symbol ON fills(symbol)",
        "CREATE INDEX IF NOT EXISTS idx_fills_order_id ON fills(order_id)",
        "CREATE INDEX IF NOT EXISTS idx_fills_ts ON fills(ts)",
        "CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts)",
        "CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)",
        "CREATE INDEX IF NOT EXISTS idx_snapshots_date ON performance_snapshots(date)",
    ] {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    info!("Database migrations completed");

    Ok(())
}
