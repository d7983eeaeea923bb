//! SQLite-backed [`BuildStore`] implementation.
//!
//! Timestamps are stored as Unix milliseconds.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{BuildRecord, BuildStatus, LogKind, LogLine};

use super::{ensure_terminal, BuildStore, NewBuild};

/// SQLite implementation of the [`BuildStore`] trait.
///
/// Wraps a [`SqlitePool`]; the schema is created by [`crate::migrate::apply`].
pub struct SqliteBuildStore {
    pool: SqlitePool,
}

impl SqliteBuildStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const BUILD_COLUMNS: &str =
    "id, book_id, book_title, source_url, status, started_at, completed_at, triggered_by";

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn build_from_row(row: &SqliteRow) -> Result<BuildRecord> {
    let status: String = row.try_get("status")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;
    Ok(BuildRecord {
        id: row.try_get("id")?,
        book_id: row.try_get("book_id")?,
        book_title: row.try_get("book_title")?,
        source_url: row.try_get("source_url")?,
        status: BuildStatus::parse(&status)?,
        started_at: from_millis(row.try_get("started_at")?)?,
        completed_at: completed_at.map(from_millis).transpose()?,
        triggered_by: row.try_get("triggered_by")?,
    })
}

fn line_from_row(row: &SqliteRow) -> Result<LogLine> {
    let kind: String = row.try_get("kind")?;
    Ok(LogLine {
        build_id: row.try_get("build_id")?,
        line_number: row.try_get("line_number")?,
        kind: LogKind::parse(&kind)?,
        content: row.try_get("content")?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl BuildStore for SqliteBuildStore {
    async fn create_build(&self, build: &NewBuild) -> Result<BuildRecord> {
        let row = sqlx::query(&format!(
            "INSERT INTO builds (book_id, book_title, source_url, status, started_at, triggered_by) \
             VALUES (?, ?, ?, 'running', ?, ?) RETURNING {}",
            BUILD_COLUMNS
        ))
        .bind(&build.book_id)
        .bind(&build.book_title)
        .bind(&build.source_url)
        .bind(Utc::now().timestamp_millis())
        .bind(&build.triggered_by)
        .fetch_one(&self.pool)
        .await?;

        build_from_row(&row)
    }

    async fn finalize_build(&self, id: i64, status: BuildStatus) -> Result<bool> {
        ensure_terminal(status)?;
        let result = sqlx::query(
            "UPDATE builds SET status = ?, completed_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.get_build(id).await?.is_none() {
            anyhow::bail!("build {} not found", id);
        }
        Ok(result.rows_affected() == 1)
    }

    async fn get_build(&self, id: i64) -> Result<Option<BuildRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM builds WHERE id = ?", BUILD_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(build_from_row).transpose()
    }

    async fn list_builds(&self, book_id: Option<&str>) -> Result<Vec<BuildRecord>> {
        let rows = match book_id {
            Some(book_id) => {
                sqlx::query(&format!(
                    "SELECT {} FROM builds WHERE book_id = ? ORDER BY started_at DESC, id DESC",
                    BUILD_COLUMNS
                ))
                .bind(book_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM builds ORDER BY started_at DESC, id DESC",
                    BUILD_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(build_from_row).collect()
    }

    async fn latest_builds(&self) -> Result<Vec<BuildRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {cols} FROM builds b WHERE b.id = ( \
                 SELECT id FROM builds WHERE book_id = b.book_id \
                 ORDER BY started_at DESC, id DESC LIMIT 1 \
             ) ORDER BY b.book_id",
            cols = BUILD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(build_from_row).collect()
    }

    async fn append_log_line(
        &self,
        build_id: i64,
        kind: LogKind,
        content: &str,
    ) -> Result<LogLine> {
        // One statement: the next number is computed under SQLite's write lock.
        let row = sqlx::query(
            "INSERT INTO build_log_lines (build_id, line_number, kind, content, created_at) \
             SELECT ?, COALESCE(MAX(line_number), 0) + 1, ?, ?, ? \
             FROM build_log_lines WHERE build_id = ? \
             RETURNING build_id, line_number, kind, content, created_at",
        )
        .bind(build_id)
        .bind(kind.as_str())
        .bind(content)
        .bind(Utc::now().timestamp_millis())
        .bind(build_id)
        .fetch_one(&self.pool)
        .await?;

        line_from_row(&row)
    }

    async fn log_lines(&self, build_id: i64) -> Result<Vec<LogLine>> {
        self.log_lines_after(build_id, 0).await
    }

    async fn log_lines_after(&self, build_id: i64, after_line: i64) -> Result<Vec<LogLine>> {
        let rows = sqlx::query(
            "SELECT build_id, line_number, kind, content, created_at FROM build_log_lines \
             WHERE build_id = ? AND line_number > ? ORDER BY line_number ASC",
        )
        .bind(build_id)
        .bind(after_line)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(line_from_row).collect()
    }
}
