//! In-memory [`BuildStore`] implementation for tests and dry runs.
//!
//! Uses one `std::sync::Mutex` over all state, so line numbering is atomic
//! in the same way the SQLite statement is.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{BuildRecord, BuildStatus, LogKind, LogLine};

use super::{ensure_terminal, BuildStore, NewBuild};

#[derive(Default)]
struct State {
    builds: Vec<BuildRecord>,
    lines: HashMap<i64, Vec<LogLine>>,
}

#[derive(Default)]
pub struct InMemoryBuildStore {
    state: Mutex<State>,
}

impl InMemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory build store lock poisoned"))
    }
}

fn newest_first(builds: &mut [BuildRecord]) {
    builds.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl BuildStore for InMemoryBuildStore {
    async fn create_build(&self, build: &NewBuild) -> Result<BuildRecord> {
        let mut state = self.lock()?;
        let record = BuildRecord {
            id: state.builds.len() as i64 + 1,
            book_id: build.book_id.clone(),
            book_title: build.book_title.clone(),
            source_url: build.source_url.clone(),
            status: BuildStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            triggered_by: build.triggered_by.clone(),
        };
        state.builds.push(record.clone());
        Ok(record)
    }

    async fn finalize_build(&self, id: i64, status: BuildStatus) -> Result<bool> {
        ensure_terminal(status)?;
        let mut state = self.lock()?;
        let record = state
            .builds
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| anyhow!("build {} not found", id))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.status = status;
        record.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn get_build(&self, id: i64) -> Result<Option<BuildRecord>> {
        Ok(self.lock()?.builds.iter().find(|b| b.id == id).cloned())
    }

    async fn list_builds(&self, book_id: Option<&str>) -> Result<Vec<BuildRecord>> {
        let mut builds: Vec<BuildRecord> = self
            .lock()?
            .builds
            .iter()
            .filter(|b| book_id.map_or(true, |id| b.book_id == id))
            .cloned()
            .collect();
        newest_first(&mut builds);
        Ok(builds)
    }

    async fn latest_builds(&self) -> Result<Vec<BuildRecord>> {
        let mut builds = self.list_builds(None).await?;
        let mut seen = std::collections::HashSet::new();
        builds.retain(|b| seen.insert(b.book_id.clone()));
        builds.sort_by(|a, b| a.book_id.cmp(&b.book_id));
        Ok(builds)
    }

    async fn append_log_line(
        &self,
        build_id: i64,
        kind: LogKind,
        content: &str,
    ) -> Result<LogLine> {
        let mut state = self.lock()?;
        let lines = state.lines.entry(build_id).or_default();
        let line = LogLine {
            build_id,
            line_number: lines.len() as i64 + 1,
            kind,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        lines.push(line.clone());
        Ok(line)
    }

    async fn log_lines(&self, build_id: i64) -> Result<Vec<LogLine>> {
        self.log_lines_after(build_id, 0).await
    }

    async fn log_lines_after(&self, build_id: i64, after_line: i64) -> Result<Vec<LogLine>> {
        Ok(self
            .lock()?
            .lines
            .get(&build_id)
            .map(|lines| {
                lines
                    .iter()
                    .filter(|l| l.line_number > after_line)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
