//! Core data models used throughout Bindery.
//!
//! These types represent the navigation tree, books, build records and the
//! log ledger that flow through the build pipeline.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One entry of a book's navigation tree.
///
/// Header groups carry no path; content items always do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentNode {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub is_header: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ContentNode>,
}

impl ContentNode {
    pub fn header(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            path: None,
            is_header: true,
            children: Vec::new(),
        }
    }

    pub fn item(title: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            path: Some(path.into()),
            is_header: false,
            children: Vec::new(),
        }
    }
}

/// A chapter in reading order, as produced by flattening the navigation tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRef {
    pub path: String,
    /// Title of the enclosing header group, or of the top-level ancestor.
    pub chapter: Option<String>,
}

/// A book checkout known to the service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String,
    pub title: String,
    /// Directory manifest and chapter paths are resolved against.
    pub root_dir: PathBuf,
    pub has_compiled_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Running,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(BuildStatus::Running),
            "success" => Ok(BuildStatus::Success),
            "failed" => Ok(BuildStatus::Failed),
            other => bail!("unknown build status: '{}'", other),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Running)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One build attempt. `status` leaves `running` exactly once.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub id: i64,
    pub book_id: String,
    pub book_title: String,
    pub source_url: String,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Stdout,
    Stderr,
    Status,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Stdout => "stdout",
            LogKind::Stderr => "stderr",
            LogKind::Status => "status",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "stdout" => Ok(LogKind::Stdout),
            "stderr" => Ok(LogKind::Stderr),
            "status" => Ok(LogKind::Status),
            other => bail!("unknown log kind: '{}'", other),
        }
    }
}

/// One persisted line of a build's append-only ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub build_id: i64,
    /// Contiguous per build, starting at 1.
    pub line_number: i64,
    pub kind: LogKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl LogLine {
    /// True for a `status` line carrying `success` or `failed`.
    pub fn is_terminal_status(&self) -> bool {
        self.kind == LogKind::Status
            && BuildStatus::parse(&self.content)
                .map(|s| s.is_terminal())
                .unwrap_or(false)
    }
}

/// One indexable chapter.
#[derive(Debug, Clone, Serialize)]
pub struct SearchDocument {
    pub id: String,
    pub path: String,
    pub title: String,
    pub chapter: Option<String>,
    pub content: String,
}
