//! Source checkout synchronization.
//!
//! Ensures `{books_dir}/{book_id}` is a valid, current git checkout:
//!
//! 1. No directory: clone.
//! 2. Directory with valid git metadata: pull.
//! 3. Directory without valid metadata (an interrupted clone, a stray
//!    folder): delete it and clone again.
//!
//! A failed clone removes whatever it left behind, so a later attempt starts
//! from case 1. The function either returns with a usable checkout or an
//! error; callers treat the error as fatal for the build.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

/// What [`sync_repository`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Cloned,
    Updated,
    /// The previous directory was not a checkout and has been replaced.
    Recloned,
}

impl SyncAction {
    pub fn describe(&self) -> &'static str {
        match self {
            SyncAction::Cloned => "cloned repository",
            SyncAction::Updated => "pulled latest changes",
            SyncAction::Recloned => "replaced invalid checkout with a fresh clone",
        }
    }
}

/// Clone or update `url` into `dest` using the `git` binary at `program`.
pub async fn sync_repository(program: &str, url: &str, dest: &Path) -> Result<SyncAction> {
    if !tokio::fs::try_exists(dest).await? {
        git_clone(program, url, dest).await?;
        return Ok(SyncAction::Cloned);
    }

    if is_valid_checkout(program, dest).await {
        git_pull(program, dest).await?;
        return Ok(SyncAction::Updated);
    }

    warn!(path = %dest.display(), "checkout has no valid git metadata, recloning");
    tokio::fs::remove_dir_all(dest)
        .await
        .with_context(|| format!("Failed to remove invalid checkout: {}", dest.display()))?;
    git_clone(program, url, dest).await?;
    Ok(SyncAction::Recloned)
}

async fn is_valid_checkout(program: &str, dir: &Path) -> bool {
    // Without its own .git, rev-parse would answer for an enclosing repository.
    if !dir.join(".git").exists() {
        return false;
    }
    match Command::new(program)
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .await
    {
        Ok(output) => {
            output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true"
        }
        Err(e) => {
            debug!(error = %e, "git rev-parse could not be executed");
            false
        }
    }
}

async fn git_clone(program: &str, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create books directory: {}", parent.display()))?;
    }

    let output = Command::new(program)
        .arg("clone")
        .arg(url)
        .arg(dest)
        .output()
        .await
        .with_context(|| format!("Failed to execute '{} clone'. Is git installed?", program))?;

    if !output.status.success() {
        if dest.exists() {
            let _ = tokio::fs::remove_dir_all(dest).await;
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git clone of {} failed: {}", url, stderr.trim());
    }

    Ok(())
}

async fn git_pull(program: &str, repo_dir: &Path) -> Result<()> {
    let output = Command::new(program)
        .args(["pull", "--ff-only"])
        .current_dir(repo_dir)
        .output()
        .await
        .with_context(|| format!("Failed to execute '{} pull'", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git pull failed: {}", stderr.trim());
    }

    Ok(())
}
