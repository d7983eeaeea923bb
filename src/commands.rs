//! CLI command implementations. Each prints human-readable output to stdout.

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio_stream::StreamExt;

use crate::book;
use crate::config::Config;
use crate::db;
use crate::events::StreamMessage;
use crate::indexer;
use crate::models::{BuildRecord, BuildStatus, LogKind, LogLine};
use crate::orchestrator::Orchestrator;
use crate::store::BuildStore;

fn format_line(line: &LogLine) -> String {
    format!("{:>5} {:<6} {}", line.line_number, line.kind.as_str(), line.content)
}

fn print_line(line: &LogLine) {
    if line.kind == LogKind::Stderr {
        eprintln!("{}", format_line(line));
    } else {
        println!("{}", format_line(line));
    }
}

fn print_build(build: &BuildRecord) {
    let completed = build
        .completed_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "#{:<5} {:<8} {:<24} started {}  completed {}{}",
        build.id,
        build.status.as_str(),
        build.book_id,
        build.started_at.to_rfc3339(),
        completed,
        build
            .triggered_by
            .as_deref()
            .map(|who| format!("  by {}", who))
            .unwrap_or_default()
    );
}

pub async fn run_books(config: &Config) -> Result<()> {
    let books = book::list_books(config).await?;
    if books.is_empty() {
        println!("No books.");
        return Ok(());
    }
    for b in books {
        println!(
            "{:<24} {}{}",
            b.id,
            b.title,
            if b.has_compiled_output { "  [pdf]" } else { "" }
        );
    }
    Ok(())
}

/// Run one build in the foreground, streaming its ledger. Fails when the
/// build ends as `failed`.
pub async fn run_build(config: &Config, book_id: &str, triggered_by: Option<String>) -> Result<()> {
    let store = db::open_store(config).await?;
    let orchestrator = Orchestrator::with_http(Arc::new(config.clone()), store)?;

    let (record, handle) = orchestrator.start(book_id, triggered_by).await?;
    println!("Build #{} started for {}", record.id, record.book_id);

    let mut stream = orchestrator.bus().subscribe(record.id).await?;
    while let Some(message) = stream.next().await {
        if let StreamMessage::Line(line) = message {
            print_line(&line);
        }
    }

    let status = handle.await?;
    if status == BuildStatus::Failed {
        bail!("build #{} failed", record.id);
    }
    println!("Build #{} succeeded: {}", record.id, book::pdf_path(config, book_id).display());
    Ok(())
}

pub async fn run_builds(config: &Config, book_id: Option<&str>, latest: bool) -> Result<()> {
    let store = db::open_store(config).await?;
    let mut builds = if latest {
        store.latest_builds().await?
    } else {
        store.list_builds(book_id).await?
    };
    if let Some(id) = book_id {
        builds.retain(|b| b.book_id == id);
    }
    if builds.is_empty() {
        println!("No builds.");
        return Ok(());
    }
    for build in &builds {
        print_build(build);
    }
    Ok(())
}

pub async fn run_logs(config: &Config, build_id: i64) -> Result<()> {
    let store = db::open_store(config).await?;
    let Some(build) = store.get_build(build_id).await? else {
        bail!("build not found: {}", build_id);
    };
    print_build(&build);
    for line in store.log_lines(build_id).await? {
        print_line(&line);
    }
    Ok(())
}

pub async fn run_search(config: &Config, book_id: &str, query: &str) -> Result<()> {
    let Some(book) = book::resolve_book(config, book_id).await? else {
        bail!("book not found: {}", book_id);
    };
    let hits = indexer::search(config, &book, query).await?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.2}] {} ({})", i + 1, hit.score, hit.title, hit.path);
    }
    Ok(())
}
