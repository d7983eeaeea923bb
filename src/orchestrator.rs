//! Build orchestration.
//!
//! A build is one task:
//!
//! ```text
//! status running → [wait for book lock] → sync checkout
//!     → (index  ∥  assemble → render)
//!     → finalize record (success = index && render) → final status line
//! ```
//!
//! [`Orchestrator::run_build`] never returns an error: any failure is written
//! to the ledger as a stderr line and the record is finalized as `failed`.
//! Builds of different books run concurrently; builds of the same book wait
//! for each other.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::assemble::ContentAssembler;
use crate::assets::{AssetFetcher, HttpFetcher};
use crate::book::{self, BookConfig};
use crate::config::Config;
use crate::events::{BuildLog, LogBus};
use crate::indexer;
use crate::models::{Book, BuildRecord, BuildStatus, ChapterRef, ContentNode};
use crate::render::{PdfRenderer, RenderOutcome};
use crate::repo_sync;
use crate::store::{BuildStore, NewBuild};
use crate::summary;

pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<dyn BuildStore>,
    bus: Arc<LogBus>,
    fetcher: Arc<dyn AssetFetcher>,
    book_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn BuildStore>,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Arc<Self> {
        let bus = Arc::new(LogBus::new(store.clone()));
        Arc::new(Self {
            config,
            store,
            bus,
            fetcher,
            book_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Orchestrator fetching remote images over HTTP.
    pub fn with_http(config: Arc<Config>, store: Arc<dyn BuildStore>) -> Result<Arc<Self>> {
        let fetcher = Arc::new(HttpFetcher::new(&config.assets)?);
        Ok(Self::new(config, store, fetcher))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BuildStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<LogBus> {
        &self.bus
    }

    /// Create the build record and start the build in the background.
    pub async fn trigger(
        self: &Arc<Self>,
        book_id: &str,
        triggered_by: Option<String>,
    ) -> Result<BuildRecord> {
        let (record, _handle) = self.start(book_id, triggered_by).await?;
        Ok(record)
    }

    /// Like [`trigger`](Self::trigger), also returning the task handle.
    pub async fn start(
        self: &Arc<Self>,
        book_id: &str,
        triggered_by: Option<String>,
    ) -> Result<(BuildRecord, JoinHandle<BuildStatus>)> {
        if !book::is_valid_book_id(book_id) {
            bail!("invalid book id '{}'", book_id);
        }

        let book_config = BookConfig::load(&book::book_dir(&self.config, book_id)).await;
        let record = self
            .store
            .create_build(&NewBuild {
                book_id: book_id.to_string(),
                book_title: book_config.display_title(book_id),
                source_url: self.config.source.repo_url(book_id),
                triggered_by,
            })
            .await
            .context("Failed to create build record")?;
        info!(build_id = record.id, book = %record.book_id, "build triggered");

        let this = Arc::clone(self);
        let build = record.clone();
        let handle = tokio::spawn(async move { this.run_build(&build).await });
        Ok((record, handle))
    }

    fn book_lock(&self, book_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .book_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(book_id.to_string()).or_default().clone()
    }

    /// Run a created build to its terminal status.
    pub async fn run_build(&self, build: &BuildRecord) -> BuildStatus {
        let log = self.bus.build_log(build.id);
        if let Err(e) = log.status(BuildStatus::Running).await {
            error!(build_id = build.id, error = %e, "failed to write build log");
        }

        let lock = self.book_lock(&build.book_id);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let _ = log
                    .stdout(format!(
                        "Waiting for the running build of {} to finish",
                        build.book_id
                    ))
                    .await;
                lock.lock().await
            }
        };

        let success = match self.execute(build, &log).await {
            Ok(success) => success,
            Err(e) => {
                let _ = log.stderr(format!("Build error: {:#}", e)).await;
                false
            }
        };

        let status = if success {
            BuildStatus::Success
        } else {
            BuildStatus::Failed
        };
        if let Err(e) = self.store.finalize_build(build.id, status).await {
            error!(build_id = build.id, error = %e, "failed to finalize build");
        }
        if let Err(e) = log.status(status).await {
            error!(build_id = build.id, error = %e, "failed to write final status");
        }
        info!(build_id = build.id, book = %build.book_id, %status, "build finished");
        status
    }

    async fn execute(&self, build: &BuildRecord, log: &BuildLog) -> Result<bool> {
        let checkout = book::book_dir(&self.config, &build.book_id);
        log.stdout(format!("Syncing {}", build.source_url)).await?;
        let action =
            repo_sync::sync_repository(&self.config.git.program, &build.source_url, &checkout)
                .await?;
        log.stdout(format!("Sync complete: {}", action.describe())).await?;

        let book = book::resolve_book(&self.config, &build.book_id)
            .await?
            .with_context(|| format!("checkout for {} disappeared after sync", build.book_id))?;
        let book_config = BookConfig::load(&checkout).await;

        let navigation = summary::load_navigation(&book.root_dir).await;
        if let Some(warning) = navigation_warning(&navigation) {
            log.stderr(warning).await?;
        }
        let chapters = summary::flatten(&navigation);

        let (indexed, rendered) = tokio::join!(
            self.index_stage(&book, log),
            self.render_stage(&book, &book_config, &chapters, log),
        );
        Ok(indexed && rendered)
    }

    async fn index_stage(&self, book: &Book, log: &BuildLog) -> bool {
        let result: Result<()> = async {
            log.stdout("Building search index").await?;
            let report = indexer::index_book(&self.config, book).await?;
            for path in &report.skipped {
                log.stderr(format!("Index skipped unreadable chapter {}", path))
                    .await?;
            }
            log.stdout(format!("Search index built: {} documents", report.documents))
                .await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                let _ = log.stderr(format!("Search index failed: {:#}", e)).await;
                false
            }
        }
    }

    async fn render_stage(
        &self,
        book: &Book,
        book_config: &BookConfig,
        chapters: &[ChapterRef],
        log: &BuildLog,
    ) -> bool {
        let result: Result<RenderOutcome> = async {
            log.stdout("Assembling document").await?;
            let assembler = ContentAssembler::new(self.config.clone(), self.fetcher.clone());
            let assembled = assembler.assemble(book, &book_config.variables, chapters, log).await?;
            log.stdout(format!("Assembled {} chapters", assembled.chapters))
                .await?;
            PdfRenderer::new(self.config.clone())
                .render(book, &book_config.typeset_title(&book.id), &assembled, log)
                .await
        }
        .await;

        match result {
            Ok(outcome) => outcome.is_success(),
            Err(e) => {
                let _ = log.stderr(format!("PDF generation failed: {:#}", e)).await;
                false
            }
        }
    }
}

/// Stderr notice for a manifest that yields nothing beyond the introduction.
fn navigation_warning(navigation: &[ContentNode]) -> Option<String> {
    match navigation.len() {
        0 => Some(format!(
            "Could not read {}; no chapters will be rendered",
            summary::MANIFEST_FILE
        )),
        1 => Some(format!(
            "No chapters found in {}; only the root document will be used",
            summary::MANIFEST_FILE
        )),
        _ => None,
    }
}
