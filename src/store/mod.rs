//! Record sink for build records and their log ledgers.
//!
//! The [`BuildStore`] trait is the only way the pipeline touches persisted
//! build state. It is the single source of truth for line numbering: every
//! [`append_log_line`](BuildStore::append_log_line) assigns the next number
//! for its build atomically, so concurrent writers cannot produce gaps or
//! duplicates.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{BuildRecord, BuildStatus, LogKind, LogLine};

pub use memory::InMemoryBuildStore;
pub use sqlite::SqliteBuildStore;

/// Fields supplied when a build attempt starts.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub book_id: String,
    pub book_title: String,
    pub source_url: String,
    pub triggered_by: Option<String>,
}

/// Abstract storage backend for builds.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_build`](BuildStore::create_build) | Insert a `running` record |
/// | [`finalize_build`](BuildStore::finalize_build) | One-shot `running → success/failed` |
/// | [`get_build`](BuildStore::get_build) | Fetch one record |
/// | [`list_builds`](BuildStore::list_builds) | Records, newest first |
/// | [`latest_builds`](BuildStore::latest_builds) | Newest record per book |
/// | [`append_log_line`](BuildStore::append_log_line) | Append to the ledger |
/// | [`log_lines`](BuildStore::log_lines) | Full ledger in line order |
/// | [`log_lines_after`](BuildStore::log_lines_after) | Ledger tail |
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn create_build(&self, build: &NewBuild) -> Result<BuildRecord>;

    /// Move a running build to a terminal status.
    ///
    /// Returns `false` (and changes nothing) when the build was already
    /// terminal. Passing [`BuildStatus::Running`] is an error.
    async fn finalize_build(&self, id: i64, status: BuildStatus) -> Result<bool>;

    async fn get_build(&self, id: i64) -> Result<Option<BuildRecord>>;

    async fn list_builds(&self, book_id: Option<&str>) -> Result<Vec<BuildRecord>>;

    async fn latest_builds(&self) -> Result<Vec<BuildRecord>>;

    async fn append_log_line(&self, build_id: i64, kind: LogKind, content: &str)
        -> Result<LogLine>;

    async fn log_lines(&self, build_id: i64) -> Result<Vec<LogLine>>;

    async fn log_lines_after(&self, build_id: i64, after_line: i64) -> Result<Vec<LogLine>>;
}

fn ensure_terminal(status: BuildStatus) -> Result<()> {
    if !status.is_terminal() {
        anyhow::bail!("builds can only be finalized as success or failed");
    }
    Ok(())
}
