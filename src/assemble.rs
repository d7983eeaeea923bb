//! Content assembly: many chapter files into one typesettable document.
//!
//! Every job gets an isolated directory `{work_dir}/bindery-{book}-{uuid}`
//! holding `book.md` and an `assets/` folder. The book's own `assets/` tree
//! is copied in first; remote images are then downloaded next to it by the
//! [`RemoteAssetCache`] so every image resolves from the working directory.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use walkdir::WalkDir;

use crate::assets::{normalize_asset_paths, AssetFetcher, RemoteAssetCache, ASSETS_DIR};
use crate::book::{join_within, replace_variables};
use crate::config::Config;
use crate::events::BuildLog;
use crate::models::{Book, ChapterRef};

pub const COMBINED_DOCUMENT: &str = "book.md";

/// Output of [`ContentAssembler::assemble`]. The caller owns `work_dir` and
/// must remove it when done.
#[derive(Debug, Clone)]
pub struct AssembledDocument {
    pub work_dir: PathBuf,
    pub document: PathBuf,
    pub chapters: usize,
}

pub struct ContentAssembler {
    config: Arc<Config>,
    fetcher: Arc<dyn AssetFetcher>,
}

impl ContentAssembler {
    pub fn new(config: Arc<Config>, fetcher: Arc<dyn AssetFetcher>) -> Self {
        Self { config, fetcher }
    }

    /// Create the working directory and write the combined document.
    ///
    /// On error the working directory is removed before returning.
    pub async fn assemble(
        &self,
        book: &Book,
        variables: &BTreeMap<String, String>,
        chapters: &[ChapterRef],
        log: &BuildLog,
    ) -> Result<AssembledDocument> {
        let work_dir = self
            .config
            .paths
            .work_dir
            .join(format!("bindery-{}-{}", book.id, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("Failed to create working directory: {}", work_dir.display()))?;

        match self.fill(&work_dir, book, variables, chapters, log).await {
            Ok(chapters) => Ok(AssembledDocument {
                document: work_dir.join(COMBINED_DOCUMENT),
                work_dir,
                chapters,
            }),
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&work_dir).await;
                Err(e)
            }
        }
    }

    async fn fill(
        &self,
        work_dir: &Path,
        book: &Book,
        variables: &BTreeMap<String, String>,
        chapters: &[ChapterRef],
        log: &BuildLog,
    ) -> Result<usize> {
        let assets_dir = work_dir.join(ASSETS_DIR);
        let copied = copy_assets(&book.root_dir.join(ASSETS_DIR), &assets_dir).await?;
        if copied > 0 {
            log.stdout(format!("Copied {} asset files", copied)).await?;
        }

        let mut cache = RemoteAssetCache::new(&assets_dir, self.fetcher.clone(), &self.config.assets);
        let mut combined = String::new();
        let mut included = 0;

        for chapter in chapters {
            let Some(path) = join_within(&book.root_dir, &chapter.path) else {
                warn!(path = %chapter.path, "skipping chapter outside the book");
                log.stderr(format!("Skipping chapter outside the book: {}", chapter.path))
                    .await?;
                continue;
            };
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable chapter");
                    log.stderr(format!("Skipping unreadable chapter {}: {}", chapter.path, e))
                        .await?;
                    continue;
                }
            };

            let content = replace_variables(&content, variables);
            let content = cache.rewrite(&content, log).await?;
            let content = normalize_asset_paths(&content);

            combined.push_str(&content);
            combined.push_str("\n\n");
            included += 1;
        }

        let document = work_dir.join(COMBINED_DOCUMENT);
        tokio::fs::write(&document, combined)
            .await
            .with_context(|| format!("Failed to write {}", document.display()))?;
        Ok(included)
    }
}

/// Copy `src` recursively into `dest`; an absent `src` leaves `dest` empty.
/// Returns the number of files copied.
async fn copy_assets(src: &Path, dest: &Path) -> Result<usize> {
    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    if !tokio::fs::try_exists(src).await? {
        return Ok(0);
    }

    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<usize> {
        let mut copied = 0;
        for entry in WalkDir::new(&src) {
            let entry = entry?;
            let relative = entry.path().strip_prefix(&src)?;
            let target = dest.join(relative);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("Failed to create {}", target.display()))?;
            } else if entry.file_type().is_file() {
                std::fs::copy(entry.path(), &target)
                    .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
                copied += 1;
            }
        }
        Ok(copied)
    })
    .await?
}
