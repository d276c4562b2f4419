use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Singleton database wrapper
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        Self::with_pool_size(db_url, 5).await
    }

    pub async fn with_pool_size(db_url: &str, max_connections: u32) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    fs::create_dir_all(parent)
                        .await
                        .context("Failed to create database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stocks (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                market TEXT NOT NULL,
                sector TEXT NOT NULL DEFAULT 'Unknown',
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create stocks table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watchlist_stocks (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                sector TEXT NOT NULL,
                fundamental_score REAL NOT NULL,
                technical_score REAL NOT NULL,
                momentum_score REAL NOT NULL,
                total_score REAL NOT NULL,
                added_at DATETIME NOT NULL,
                active BOOLEAN NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_watchlist_active
            ON watchlist_stocks (active, total_score);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create watchlist_stocks table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_selections (
                code TEXT NOT NULL,
                selection_date DATE NOT NULL,
                entry_price TEXT NOT NULL,
                attractiveness REAL NOT NULL,
                risk_score REAL NOT NULL,
                signal_count INTEGER NOT NULL,
                stop_loss TEXT NOT NULL,
                take_profit TEXT NOT NULL,
                target_position_fraction TEXT NOT NULL,
                sector TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (code, selection_date)
            );
            CREATE INDEX IF NOT EXISTS idx_selections_date_status
            ON daily_selections (selection_date, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create daily_selections table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL,
                side TEXT NOT NULL,
                requested_price TEXT NOT NULL,
                filled_price TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                fees TEXT NOT NULL DEFAULT '0',
                commission TEXT NOT NULL DEFAULT '0',
                slippage_pct TEXT NOT NULL DEFAULT '0',
                realized_pnl TEXT,
                entry_time DATETIME NOT NULL,
                exit_time DATETIME,
                strategy_tag TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_trades_code_time
            ON trades (code, entry_time);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS error_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                logged_at DATETIME NOT NULL,
                severity TEXT NOT NULL,
                service TEXT NOT NULL,
                module TEXT NOT NULL,
                message TEXT NOT NULL,
                stack TEXT,
                type_tag TEXT NOT NULL DEFAULT '',
                correlation_id TEXT,
                resolved_at DATETIME,
                resolution_note TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_error_logs_time
            ON error_logs (logged_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create error_logs table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
