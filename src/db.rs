//! SQLite connection setup.
//!
//! The database runs in WAL mode so the HTTP API can read build records and
//! log lines while builds append to them. Writers that collide wait on the
//! busy timeout instead of failing.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::migrate;
use crate::store::{BuildStore, SqliteBuildStore};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    connect_path(&config.db.path).await
}

pub async fn connect_path(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", db_path.display()))
}

/// Connect, bring the schema up to date and wrap the pool as a build store.
pub async fn open_store(config: &Config) -> Result<Arc<dyn BuildStore>> {
    let pool = connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteBuildStore::new(pool)))
}
