//! PDF rendering through an external typesetter.
//!
//! The typesetter runs inside the assembled working directory. Its stdout
//! and stderr are read as raw chunks, split into lines as they complete and
//! forwarded to the build ledger through a single channel, so the ledger
//! sees each line as soon as it is written. A trailing partial line is
//! flushed when the stream closes.
//!
//! Exit status alone does not decide the outcome; see [`classify`].

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::assemble::{AssembledDocument, COMBINED_DOCUMENT};
use crate::book;
use crate::config::{Config, TypesetterConfig};
use crate::events::BuildLog;
use crate::models::{Book, LogKind};

const RENDERED_FILE: &str = "book.pdf";
const READ_CHUNK: usize = 4096;

/// Splits a byte stream into lines. Bytes are kept until a newline arrives,
/// so multi-byte characters split across chunks survive intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left after the stream closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// How a typesetter run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Success,
    /// Non-zero exit, but the PDF was produced.
    SuccessWithWarnings,
    Failed,
}

impl RenderOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, RenderOutcome::Failed)
    }
}

/// The output file is what counts: a non-zero exit with a PDF on disk is a
/// success with warnings, and no PDF is a failure whatever the exit code.
pub fn classify(exit_success: bool, output_exists: bool) -> RenderOutcome {
    match (exit_success, output_exists) {
        (_, false) => RenderOutcome::Failed,
        (true, true) => RenderOutcome::Success,
        (false, true) => RenderOutcome::SuccessWithWarnings,
    }
}

/// Command-line arguments for one typesetter run (relative to the working
/// directory).
pub fn typesetter_args(config: &TypesetterConfig, title: &str) -> Vec<String> {
    let mut args = vec![
        COMBINED_DOCUMENT.to_string(),
        "-o".to_string(),
        RENDERED_FILE.to_string(),
    ];
    if let Some(engine) = config.pdf_engine.as_deref().filter(|e| !e.is_empty()) {
        args.push(format!("--pdf-engine={}", engine));
    }
    args.push(format!("--resource-path=.:{}", crate::assets::ASSETS_DIR));
    args.push("-V".to_string());
    args.push(format!("title={}", title));
    for (key, value) in &config.variables {
        args.push("-V".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push("--toc".to_string());
    args.push(format!("--toc-depth={}", config.toc_depth));
    args.push("--from".to_string());
    args.push("markdown-fancy_lists".to_string());
    args.push("-N".to_string());
    args.extend(config.extra_args.iter().cloned());
    args
}

async fn pump<R>(mut reader: R, kind: LogKind, tx: mpsc::UnboundedSender<(LogKind, String)>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::default();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for line in buffer.push(&chunk[..n]) {
            let _ = tx.send((kind, line));
        }
    }
    if let Some(rest) = buffer.finish() {
        let _ = tx.send((kind, rest));
    }
    Ok(())
}

pub struct PdfRenderer {
    config: Arc<Config>,
}

impl PdfRenderer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Typeset `assembled` under `title` and publish the PDF for `book`.
    ///
    /// The working directory is removed afterwards whatever the outcome.
    pub async fn render(
        &self,
        book: &Book,
        title: &str,
        assembled: &AssembledDocument,
        log: &BuildLog,
    ) -> Result<RenderOutcome> {
        let result = self.render_in(book, title, &assembled.work_dir, log).await;
        if let Err(e) = tokio::fs::remove_dir_all(&assembled.work_dir).await {
            warn!(path = %assembled.work_dir.display(), error = %e, "failed to remove working directory");
        }
        result
    }

    async fn render_in(
        &self,
        book: &Book,
        title: &str,
        work_dir: &Path,
        log: &BuildLog,
    ) -> Result<RenderOutcome> {
        let typesetter = &self.config.typesetter;
        let args = typesetter_args(typesetter, title);
        log.stdout(format!("Running {} for \"{}\"", typesetter.program, title))
            .await?;

        let mut child = Command::new(&typesetter.program)
            .args(&args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start typesetter '{}'", typesetter.program))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, LogKind::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, LogKind::Stderr, tx.clone())));
        }
        drop(tx);

        // Closes once both pumps have hit end of stream.
        while let Some((kind, line)) = rx.recv().await {
            log.line(kind, &line).await?;
        }
        for pump in pumps {
            pump.await??;
        }

        let status = child
            .wait()
            .await
            .context("Failed to wait for typesetter")?;
        let output = work_dir.join(RENDERED_FILE);
        let outcome = classify(status.success(), tokio::fs::try_exists(&output).await?);

        match outcome {
            RenderOutcome::Failed => {
                log.stderr(format!(
                    "{} exited with {} and produced no PDF",
                    typesetter.program, status
                ))
                .await?;
                return Ok(outcome);
            }
            RenderOutcome::SuccessWithWarnings => {
                log.stderr(format!(
                    "{} exited with {} but produced a PDF; continuing",
                    typesetter.program, status
                ))
                .await?;
            }
            RenderOutcome::Success => {}
        }

        let published = book::pdf_path(&self.config, &book.id);
        if let Some(parent) = published.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::copy(&output, &published)
            .await
            .with_context(|| format!("Failed to publish PDF to {}", published.display()))?;

        info!(book = %book.id, path = %published.display(), "PDF published");
        log.stdout(format!("PDF generated: {}", published.display()))
            .await?;
        Ok(outcome)
    }
}
