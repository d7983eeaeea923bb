//! HTTP API tests against an in-process server on a free port.

mod common;

use bindery::orchestrator::Orchestrator;
use bindery::server::{self, EVENT_HEADER, SIGNATURE_HEADER};
use bindery::webhook;
use common::{setup, BOOK, WARNING_TYPESETTER};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;

async fn serve(orchestrator: Arc<Orchestrator>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(orchestrator))
            .await
            .unwrap();
    });
    format!("http://{}", addr)
}

/// Read an SSE response to its end and decode each `data:` payload.
async fn read_events(response: reqwest::Response) -> Vec<Value> {
    let body = response.text().await.unwrap();
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

fn push_payload(full_name: &str, clone_url: &str) -> String {
    json!({
        "ref": "refs/heads/main",
        "repository": { "full_name": full_name, "clone_url": clone_url }
    })
    .to_string()
}

#[tokio::test]
async fn health_and_empty_catalogue() {
    let (_tmp, orchestrator, _) = setup(WARNING_TYPESETTER).await;
    let base = serve(orchestrator).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let books: Value = client
        .get(format!("{}/api/books", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(books["books"], json!([]));

    let builds: Value = client
        .get(format!("{}/api/builds", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(builds["builds"], json!([]));

    let missing = client
        .get(format!("{}/api/builds/999", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let search = client
        .get(format!("{}/api/books/{}/search?q=owner", base, BOOK))
        .send()
        .await
        .unwrap();
    assert_eq!(search.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn trigger_rejects_missing_or_invalid_book_id() {
    let (_tmp, orchestrator, _) = setup(WARNING_TYPESETTER).await;
    let base = serve(orchestrator.clone()).await;
    let client = reqwest::Client::new();

    for body in [json!({}), json!({"bookId": "  "}), json!({"bookId": "../etc"})] {
        let response = client
            .post(format!("{}/api/builds/trigger", base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {}", body);
        let err: Value = response.json().await.unwrap();
        assert_eq!(err["error"]["code"], "bad_request");
    }
    assert!(orchestrator.store().list_builds(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn triggered_build_streams_and_is_queryable() {
    let (_tmp, orchestrator, _) = setup(WARNING_TYPESETTER).await;
    let base = serve(orchestrator).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/builds/trigger", base))
        .json(&json!({"bookId": BOOK, "triggeredBy": "alice"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let record: Value = response.json().await.unwrap();
    assert_eq!(record["status"], "running");
    assert_eq!(record["bookId"], BOOK);
    assert_eq!(record["triggeredBy"], "alice");
    let id = record["id"].as_i64().unwrap();

    // The stream ends once the build has finished.
    let stream = client
        .get(format!("{}/api/builds/{}/stream", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), StatusCode::OK);
    let events = read_events(stream).await;
    assert_eq!(events.last().unwrap(), &json!({"type": "complete", "buildId": id}));
    let numbers: Vec<i64> = events[..events.len() - 1]
        .iter()
        .map(|e| e["lineNumber"].as_i64().unwrap())
        .collect();
    assert_eq!(numbers, (1..=numbers.len() as i64).collect::<Vec<_>>());
    assert_eq!(events[events.len() - 2]["type"], "status");
    assert_eq!(events[events.len() - 2]["data"], "success");

    let build: Value = client
        .get(format!("{}/api/builds/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(build["status"], "success");
    assert!(build["completedAt"].is_string());

    let logs: Value = client
        .get(format!("{}/api/builds/{}/logs", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs["buildId"], id);
    assert_eq!(logs["status"], "success");
    assert_eq!(logs["lines"].as_array().unwrap().len(), numbers.len());

    let latest: Value = client
        .get(format!("{}/api/builds?latest=true&bookId={}", base, BOOK))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(latest["builds"][0]["id"], id);

    let books: Value = client
        .get(format!("{}/api/books", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(books["books"][0]["id"], BOOK);
    assert_eq!(books["books"][0]["title"], "The Demo Book");
    assert_eq!(books["books"][0]["hasCompiledOutput"], true);

    let search: Value = client
        .get(format!("{}/api/books/{}/search?q=owner", base, BOOK))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(search["query"], "owner");
    assert_eq!(search["results"][0]["path"], "chapters/ownership.md");
}

#[tokio::test]
async fn webhook_ignores_foreign_and_non_push_deliveries() {
    let (_tmp, orchestrator, _) = setup(WARNING_TYPESETTER).await;
    let base = serve(orchestrator.clone()).await;
    let client = reqwest::Client::new();

    let status: Value = client
        .get(format!("{}/api/webhook", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["organization"], "acme");

    let ping = client
        .post(format!("{}/api/webhook", base))
        .header(EVENT_HEADER, "ping")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(ping.status(), StatusCode::OK);
    let body: Value = ping.json().await.unwrap();
    assert_eq!(body["message"], "Event ignored");

    let foreign = client
        .post(format!("{}/api/webhook", base))
        .header(EVENT_HEADER, "push")
        .body(push_payload("other/book", "https://github.com/other/book.git"))
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status(), StatusCode::OK);

    let garbage = client
        .post(format!("{}/api/webhook", base))
        .header(EVENT_HEADER, "push")
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

    let no_book = client
        .post(format!("{}/api/webhook", base))
        .header(EVENT_HEADER, "push")
        .body(push_payload("acme/book", ""))
        .send()
        .await
        .unwrap();
    assert_eq!(no_book.status(), StatusCode::BAD_REQUEST);

    assert!(orchestrator.store().list_builds(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn signed_push_triggers_build() {
    let (_tmp, orchestrator, fetcher) = setup(WARNING_TYPESETTER).await;
    let mut config = (**orchestrator.config()).clone();
    config.webhook.secret = Some("s3cret".to_string());
    let orchestrator = Orchestrator::new(
        Arc::new(config),
        orchestrator.store().clone(),
        fetcher,
    );
    let base = serve(orchestrator.clone()).await;
    let client = reqwest::Client::new();

    let body = push_payload(
        &format!("acme/{}", BOOK),
        &format!("https://github.com/acme/{}.git", BOOK),
    );

    let unsigned = client
        .post(format!("{}/api/webhook", base))
        .header(EVENT_HEADER, "push")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let forged = client
        .post(format!("{}/api/webhook", base))
        .header(EVENT_HEADER, "push")
        .header(SIGNATURE_HEADER, webhook::sign("wrong", body.as_bytes()))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
    assert!(orchestrator.store().list_builds(None).await.unwrap().is_empty());

    let accepted = client
        .post(format!("{}/api/webhook", base))
        .header(EVENT_HEADER, "push")
        .header(SIGNATURE_HEADER, webhook::sign("s3cret", body.as_bytes()))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let reply: Value = accepted.json().await.unwrap();
    assert_eq!(reply["message"], "Build triggered");
    assert_eq!(reply["repository"], format!("acme/{}", BOOK));
    let id = reply["buildId"].as_i64().unwrap();

    let record = orchestrator.store().get_build(id).await.unwrap().unwrap();
    assert_eq!(record.book_id, BOOK);
    assert_eq!(
        record.triggered_by.as_deref(),
        Some(format!("webhook:acme/{}", BOOK).as_str())
    );

    // Let the build finish before the temp dir goes away.
    let events = read_events(
        client
            .get(format!("{}/api/builds/{}/stream", base, id))
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(events.last().unwrap()["type"], "complete");
}
