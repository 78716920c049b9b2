//! SSE integration tests for the per-job stream and the admin firehose.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{sse_events, TestHarness};
use http_body_util::BodyExt;
use tm_core::{JobId, JobState, PlanTier, SessionId, ToolId, ToolOptions};
use tm_db::{JobPatch, JobStore, NewJob};

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn read_to_end(response: axum::response::Response) -> String {
    let bytes = tokio::time::timeout(Duration::from_secs(60), response.into_body().collect())
        .await
        .expect("stream did not close")
        .unwrap()
        .to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn finished_job_sends_terminal_event_once() {
    let harness = TestHarness::new();
    harness.start().await;
    let job = harness.submit(ToolId::PdfCompress, &["done"]).await;
    harness.wait_terminal(job.id).await;

    let resp = harness
        .request(get(&format!("/api/jobs/{}/events", job.id)))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");

    let events = sse_events(&read_to_end(resp).await);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "completed");
    assert_eq!(events[0].1["type"], "completed");
    assert_eq!(events[0].1["result"][0]["name"], "out-done.txt");

    harness.shutdown().await;
}

#[tokio::test]
async fn live_stream_ends_after_terminal_event() {
    let harness = TestHarness::new();
    harness.start().await;
    let job = harness.submit(ToolId::VideoTrim, &["clip"]).await;

    let resp = harness
        .request(get(&format!("/api/jobs/{}/events", job.id)))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    harness.stubs.gate.add_permits(1);

    let events = sse_events(&read_to_end(resp).await);
    let (last, progress) = events.split_last().expect("no events");
    assert_eq!(last.0, "completed");
    assert!(progress.iter().all(|(name, _)| name == "progress"));

    let values: Vec<u64> = progress
        .iter()
        .map(|(_, data)| data["progress"].as_u64().unwrap())
        .collect();
    assert!(values.windows(2).all(|w| w[0] < w[1]), "{values:?}");
    assert_eq!(values.last(), Some(&100));

    // The subscription goes away with the stream.
    assert_eq!(harness.engine.events().subscriber_count(job.id), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn failed_job_stream_carries_reason() {
    let harness = TestHarness::new();
    harness.start().await;
    let job = harness.submit(ToolId::PdfOcr, &["scan"]).await;

    let resp = harness
        .request(get(&format!("/api/jobs/{}/events", job.id)))
        .await;
    let events = sse_events(&read_to_end(resp).await);
    let last = events.last().expect("no events");
    assert_eq!(last.0, "failed");
    assert_eq!(last.1["reason"], "Unknown tool: pdf-ocr");

    harness.shutdown().await;
}

#[tokio::test]
async fn events_for_unknown_job_is_404() {
    let harness = TestHarness::new();
    let resp = harness
        .request(get(&format!("/api/jobs/{}/events", JobId::new())))
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

/// Queued job with no inputs, created straight in the store.
fn stored_job(harness: &TestHarness) -> tm_core::Job {
    harness
        .store
        .create(NewJob {
            session_id: SessionId::new(),
            tool: ToolId::PdfCompress,
            inputs: vec![],
            options: ToolOptions::new(),
            owner: "watcher".into(),
            tier: PlanTier::Free,
            priority: 0,
            max_attempts: 3,
        })
        .unwrap()
}

/// Fail the job in the store without publishing anything.
fn fail_silently(harness: &TestHarness, id: JobId) {
    harness
        .store
        .transition(id, JobState::Queued, JobState::Active, JobPatch::default())
        .unwrap();
    harness
        .store
        .transition(id, JobState::Active, JobState::Failed, JobPatch::failed("gone quiet"))
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn stream_closes_when_job_is_purged() {
    let harness = TestHarness::new();
    let job = stored_job(&harness);

    let resp = harness
        .request(get(&format!("/api/jobs/{}/events", job.id)))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    fail_silently(&harness, job.id);
    let future = chrono::Utc::now() + chrono::Duration::days(2);
    assert_eq!(harness.store.delete_terminal(JobState::Failed, future).unwrap().len(), 1);

    let events = sse_events(&read_to_end(resp).await);
    assert_eq!(events.len(), 1, "{events:?}");
    assert_eq!(events[0].0, "progress");
}

#[tokio::test(start_paused = true)]
async fn stream_reports_terminal_state_it_never_heard_about() {
    let harness = TestHarness::new();
    let job = stored_job(&harness);

    let resp = harness
        .request(get(&format!("/api/jobs/{}/events", job.id)))
        .await;
    fail_silently(&harness, job.id);

    let events = sse_events(&read_to_end(resp).await);
    let last = events.last().expect("no events");
    assert_eq!(last.0, "failed");
    assert_eq!(last.1["reason"], "gone quiet");
}

#[tokio::test]
async fn firehose_replays_recent_events() {
    let harness = TestHarness::new();
    harness.start().await;
    let job = harness.submit(ToolId::PdfCompress, &["seen"]).await;
    harness.wait_terminal(job.id).await;

    let resp = harness.request(get("/api/events")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let mut body = resp.into_body();

    // The firehose never ends; read until the replayed completion shows up.
    let mut text = String::new();
    while !text.contains("event: completed") {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("no replay")
            .expect("stream ended")
            .unwrap();
        if let Ok(data) = frame.into_data() {
            text.push_str(std::str::from_utf8(&data).unwrap());
        }
    }

    let events = sse_events(&text);
    assert!(events.iter().any(|(name, data)| name == "progress"
        && data["job_id"] == job.id.to_string()));
    let first_progress = events
        .iter()
        .find(|(name, _)| name == "progress")
        .map(|(_, data)| data["progress"].as_u64().unwrap());
    assert_eq!(first_progress, Some(5), "replay is oldest first");

    harness.shutdown().await;
}
