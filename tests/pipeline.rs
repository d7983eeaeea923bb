//! End-to-end builds against a local git repository and a fake typesetter.

mod common;

use bindery::book;
use bindery::events::StreamMessage;
use bindery::indexer;
use bindery::models::{BuildStatus, LogKind, LogLine};
use common::{git, setup, BOOK, FAILING_TYPESETTER, WARNING_TYPESETTER};
use std::fs;
use std::sync::atomic::Ordering;
use tokio_stream::StreamExt;

fn assert_contiguous(lines: &[LogLine]) {
    let numbers: Vec<i64> = lines.iter().map(|l| l.line_number).collect();
    let expected: Vec<i64> = (1..=lines.len() as i64).collect();
    assert_eq!(numbers, expected);
}

#[tokio::test]
async fn build_publishes_pdf_and_index() {
    let (tmp, orchestrator, fetcher) = setup(WARNING_TYPESETTER).await;
    let config = orchestrator.config().clone();

    let (record, handle) = orchestrator
        .start(BOOK, Some("tester".to_string()))
        .await
        .unwrap();
    assert_eq!(record.status, BuildStatus::Running);
    assert_eq!(record.book_title, BOOK.replace('-', " "));
    let status = handle.await.unwrap();

    let lines = orchestrator.store().log_lines(record.id).await.unwrap();
    let dump: Vec<String> = lines.iter().map(|l| l.content.clone()).collect();
    assert_eq!(status, BuildStatus::Success, "ledger: {:#?}", dump);

    let stored = orchestrator.store().get_build(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BuildStatus::Success);
    assert!(stored.completed_at.is_some());
    assert_eq!(stored.triggered_by.as_deref(), Some("tester"));

    // The fake typesetter copies its input, so the PDF is the combined document.
    let pdf = fs::read_to_string(book::pdf_path(&config, BOOK)).unwrap();
    let readme = pdf.find("Welcome to the second edition.").unwrap();
    let ownership = pdf.find("Every value has an owner.").unwrap();
    let borrowing = pdf.find("References borrow values.").unwrap();
    assert!(readme < ownership && ownership < borrowing);
    assert!(pdf.contains("![diagram](assets/owner.png)"));
    assert!(pdf.contains("![remote](assets/remote-image-1.png)"));
    assert!(pdf.contains("![remote again](assets/remote-image-1.png)"));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    // Working directories are gone.
    assert_eq!(fs::read_dir(tmp.path().join("work")).unwrap().count(), 0);

    // Ledger: contiguous, running first, success last, typesetter output captured.
    assert_contiguous(&lines);
    assert_eq!(lines[0].kind, LogKind::Status);
    assert_eq!(lines[0].content, "running");
    let last = lines.last().unwrap();
    assert_eq!((last.kind, last.content.as_str()), (LogKind::Status, "success"));
    assert!(lines
        .iter()
        .any(|l| l.kind == LogKind::Stdout && l.content == "typesetting book.md"));
    assert!(lines
        .iter()
        .any(|l| l.kind == LogKind::Stdout && l.content == "no trailing newline"));
    assert!(lines
        .iter()
        .any(|l| l.kind == LogKind::Stderr && l.content.contains("Missing character")));
    assert!(lines
        .iter()
        .any(|l| l.kind == LogKind::Stderr && l.content.contains("chapters/ghost.md")));

    // Search index was persisted and answers queries.
    assert!(book::search_index_path(&config, BOOK).exists());
    let book = book::resolve_book(&config, BOOK).await.unwrap().unwrap();
    assert_eq!(book.title, "The Demo Book");
    assert!(book.has_compiled_output);
    let hits = indexer::search(&config, &book, "borrow").await.unwrap();
    assert_eq!(hits[0].path, "chapters/borrowing.md");
    assert_eq!(hits[0].title, "Borrowing");
}

#[tokio::test]
async fn failed_render_still_indexes_and_fails_build() {
    let (_tmp, orchestrator, _) = setup(FAILING_TYPESETTER).await;
    let config = orchestrator.config().clone();

    let (record, handle) = orchestrator.start(BOOK, None).await.unwrap();
    assert_eq!(handle.await.unwrap(), BuildStatus::Failed);

    assert!(!book::pdf_path(&config, BOOK).exists());
    assert!(book::search_index_path(&config, BOOK).exists());

    let lines = orchestrator.store().log_lines(record.id).await.unwrap();
    assert_contiguous(&lines);
    assert!(lines
        .iter()
        .any(|l| l.kind == LogKind::Stderr && l.content == "Error producing PDF."));
    assert_eq!(lines.last().unwrap().content, "failed");
}

#[tokio::test]
async fn failed_index_still_publishes_pdf_and_fails_build() {
    let (_tmp, orchestrator, _) = setup(WARNING_TYPESETTER).await;
    let config = orchestrator.config().clone();
    // A directory where the index file belongs makes the final rename fail.
    fs::create_dir_all(book::search_index_path(&config, BOOK)).unwrap();

    let (record, handle) = orchestrator.start(BOOK, None).await.unwrap();
    assert_eq!(handle.await.unwrap(), BuildStatus::Failed);

    assert!(book::pdf_path(&config, BOOK).exists());
    let stored = orchestrator.store().get_build(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BuildStatus::Failed);

    let lines = orchestrator.store().log_lines(record.id).await.unwrap();
    assert_contiguous(&lines);
    assert!(lines
        .iter()
        .any(|l| l.kind == LogKind::Stderr && l.content.starts_with("Search index failed")));
    assert!(lines
        .iter()
        .any(|l| l.kind == LogKind::Stdout && l.content.starts_with("PDF generated")));
    assert_eq!(lines.last().unwrap().content, "failed");
}

#[tokio::test]
async fn untitled_book_is_typeset_under_its_id() {
    let (tmp, orchestrator, _) = setup(WARNING_TYPESETTER).await;
    let origin = tmp.path().join("remotes/acme").join(format!("{}.git", BOOK));
    fs::write(origin.join("book.json"), "{}").unwrap();
    git(&origin, &["commit", "-q", "-am", "drop title"]);

    let (record, handle) = orchestrator.start(BOOK, None).await.unwrap();
    assert_eq!(handle.await.unwrap(), BuildStatus::Success);

    let lines = orchestrator.store().log_lines(record.id).await.unwrap();
    let expected = format!("for \"{}\"", BOOK);
    assert!(lines.iter().any(|l| l.kind == LogKind::Stdout
        && l.content.starts_with("Running")
        && l.content.ends_with(&expected)));
}

#[tokio::test]
async fn unknown_repository_fails_at_sync() {
    let (_tmp, orchestrator, _) = setup(WARNING_TYPESETTER).await;

    let (record, handle) = orchestrator.start("no-such-book", None).await.unwrap();
    assert_eq!(handle.await.unwrap(), BuildStatus::Failed);

    let lines = orchestrator.store().log_lines(record.id).await.unwrap();
    assert!(lines
        .iter()
        .any(|l| l.kind == LogKind::Stderr && l.content.contains("git clone")));
    let stored = orchestrator.store().get_build(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BuildStatus::Failed);
}

#[tokio::test]
async fn same_book_builds_run_one_after_another() {
    let (_tmp, orchestrator, _) = setup(WARNING_TYPESETTER).await;

    let (first, h1) = orchestrator.start(BOOK, None).await.unwrap();
    let (second, h2) = orchestrator.start(BOOK, None).await.unwrap();
    let (s1, s2) = tokio::join!(h1, h2);
    assert_eq!(s1.unwrap(), BuildStatus::Success);
    assert_eq!(s2.unwrap(), BuildStatus::Success);

    for id in [first.id, second.id] {
        let lines = orchestrator.store().log_lines(id).await.unwrap();
        assert_contiguous(&lines);
        assert_eq!(lines.last().unwrap().content, "success");
    }

    // Whichever build took the lock second updated the existing checkout.
    let mut pulls = 0;
    for id in [first.id, second.id] {
        let lines = orchestrator.store().log_lines(id).await.unwrap();
        if lines.iter().any(|l| l.content.contains("pulled latest changes")) {
            pulls += 1;
        }
    }
    assert_eq!(pulls, 1);
}

#[tokio::test]
async fn live_subscriber_receives_whole_ledger_then_complete() {
    let (_tmp, orchestrator, _) = setup(WARNING_TYPESETTER).await;

    let (record, handle) = orchestrator.start(BOOK, None).await.unwrap();
    let stream = orchestrator.bus().subscribe(record.id).await.unwrap();
    let messages: Vec<StreamMessage> = stream.collect().await;
    handle.await.unwrap();

    assert_eq!(
        messages.last(),
        Some(&StreamMessage::Complete {
            build_id: record.id
        })
    );
    let streamed: Vec<LogLine> = messages
        .into_iter()
        .filter_map(|m| match m {
            StreamMessage::Line(l) => Some(l),
            StreamMessage::Complete { .. } => None,
        })
        .collect();
    let persisted = orchestrator.store().log_lines(record.id).await.unwrap();
    assert_eq!(streamed, persisted);

    // A late subscriber gets the same backlog and an immediate completion.
    let replay: Vec<StreamMessage> = orchestrator
        .bus()
        .subscribe(record.id)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(replay.len(), persisted.len() + 1);
    assert!(replay.last().unwrap().is_complete());
}
