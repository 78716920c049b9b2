//! Job lifecycle integration tests.
//!
//! Drives the engine end to end: submission, worker claims, weighted
//! progress, retries with backoff, terminal states and startup recovery.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use common::{test_config, TestHarness};
use tm_core::events::JobEventKind;
use tm_core::{JobState, PlanTier, SessionId, ToolId, ToolOptions};
use tm_db::{JobStore, NewJob};
use tm_engine::StorageScope;

// ---------------------------------------------------------------------------
// Success path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_files_complete_in_order() {
    let harness = TestHarness::new();
    let job = harness.submit(ToolId::PdfCompress, &["a", "b", "c"]).await;
    assert_eq!(job.state, JobState::Queued);
    let (_, mut events) = harness.engine.watch(job.id).unwrap();

    harness.start().await;
    let done = harness.wait_terminal(job.id).await;

    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.attempts, 1);
    assert!(done.failure_reason.is_none());

    let result = done.result.expect("completed job has a result");
    let names: Vec<_> = result.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["out-a.txt", "out-b.txt", "out-c.txt"]);
    let first = harness.engine.storage().fetch(&result[0]).await.unwrap();
    assert_eq!(&first[..], b"A");

    let mut progress = Vec::new();
    let mut terminal = Vec::new();
    while let Some(event) = events.try_recv() {
        match event.kind {
            JobEventKind::Progress { progress: p } => progress.push(p),
            other => terminal.push(other),
        }
    }
    assert_eq!(progress, [5, 10, 23, 37, 50, 63, 77, 100]);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], JobEventKind::Completed { ref result } if result.len() == 3));

    harness.shutdown().await;
}

#[tokio::test]
async fn inputs_are_removed_after_completion() {
    let harness = TestHarness::new();
    harness.start().await;
    let job = harness.submit(ToolId::PdfCompress, &["keep"]).await;
    let done = harness.wait_terminal(job.id).await;
    assert_eq!(done.state, JobState::Completed);

    let input_dir = harness
        .dir
        .path()
        .join(job.session_id.to_string())
        .join(StorageScope::Input.as_str());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while input_dir.exists() {
        assert!(tokio::time::Instant::now() < deadline, "inputs never purged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Outputs stay until retention removes them.
    let output = &done.result.unwrap()[0];
    assert!(harness.engine.storage().fetch(output).await.is_ok());

    harness.shutdown().await;
}

// ---------------------------------------------------------------------------
// Failure and retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn always_failing_job_is_claimed_three_times() {
    let harness = TestHarness::new();
    harness.start().await;
    let job = harness.submit(ToolId::ImgCompress, &["x"]).await;
    let (_, mut events) = harness.engine.watch(job.id).unwrap();

    let done = harness.wait_terminal(job.id).await;
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.attempts, 3);
    assert!(done.result.is_none());
    assert_eq!(
        done.failure_reason.as_deref(),
        Some("Tool error [always-fails]: call 3 failed")
    );
    assert_eq!(harness.stubs.failing.calls.load(Ordering::SeqCst), 3);

    // Exactly one terminal event, and it is the last one.
    let mut kinds = Vec::new();
    while let Some(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    let failed: Vec<_> = kinds
        .iter()
        .filter(|k| matches!(k, JobEventKind::Failed { .. }))
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(matches!(kinds.last(), Some(JobEventKind::Failed { .. })));

    harness.shutdown().await;
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let harness = TestHarness::new();
    harness.start().await;
    let job = harness.submit(ToolId::PdfRepair, &["scan"]).await;

    let done = harness.wait_terminal(job.id).await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.attempts, 2);
    assert_eq!(done.progress, 100);
    assert_eq!(harness.stubs.flaky.calls.load(Ordering::SeqCst), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn unknown_tool_fails_without_retry() {
    let harness = TestHarness::new();
    harness.start().await;
    let job = harness.submit(ToolId::PdfOcr, &["page"]).await;

    let done = harness.wait_terminal(job.id).await;
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.attempts, 1);
    assert_eq!(done.failure_reason.as_deref(), Some("Unknown tool: pdf-ocr"));

    harness.shutdown().await;
}

#[tokio::test]
async fn retry_starts_from_clean_outputs() {
    let harness = TestHarness::new();
    harness.start().await;
    let job = harness.submit(ToolId::ImgResize, &["a", "b"]).await;

    let done = harness.wait_terminal(job.id).await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.attempts, 2);
    let names: Vec<_> = done.result.unwrap().into_iter().map(|f| f.name).collect();
    assert_eq!(names, ["a.txt", "b.txt"]);

    let output_dir = harness
        .dir
        .path()
        .join(job.session_id.to_string())
        .join(StorageScope::Output.as_str());
    let mut stored: Vec<_> = std::fs::read_dir(output_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    stored.sort();
    assert_eq!(stored, ["a.txt", "b.txt"]);

    harness.shutdown().await;
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retried_job_that_reports_progress_keeps_its_lease() {
    let mut config = test_config();
    config.workers.lease_timeout_secs = 1;
    config.workers.sweep_interval_secs = 1;
    let harness = TestHarness::with_config(config);
    harness.start().await;

    // The first attempt ends at 90; the retry reports below that for 3s,
    // well past the one second lease.
    let job = harness.submit(ToolId::VideoCompress, &["clip"]).await;
    let done = harness.wait_terminal(job.id).await;

    let stub = &harness.stubs.slow_retry;
    assert_eq!(done.state, JobState::Completed, "{:?}", done.failure_reason);
    assert_eq!(done.attempts, 2);
    assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    assert_eq!(stub.max_running.load(Ordering::SeqCst), 1);

    harness.shutdown().await;
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn at_most_five_jobs_run_at_once() {
    let harness = TestHarness::new();
    harness.start().await;

    let mut ids = Vec::new();
    for i in 0..7 {
        let name = format!("clip{i}");
        ids.push(harness.submit(ToolId::VideoTrim, &[name.as_str()]).await.id);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let active = harness.store.list_in_state(JobState::Active).unwrap().len();
        if active == 5 {
            break;
        }
        assert!(active < 5, "{active} jobs active");
        assert!(tokio::time::Instant::now() < deadline, "workers never filled up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Give a sixth claim a chance to happen if the pool were too large.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.store.list_in_state(JobState::Active).unwrap().len(), 5);
    assert_eq!(harness.store.list_in_state(JobState::Queued).unwrap().len(), 2);

    harness.stubs.gate.add_permits(ids.len());
    for id in ids {
        assert_eq!(harness.wait_terminal(id).await.state, JobState::Completed);
    }

    harness.shutdown().await;
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_jobs_are_recovered_on_start() {
    let harness = TestHarness::new();

    // A job persisted by a previous run: in the store, never enqueued here.
    let session = SessionId::new();
    let input = harness
        .engine
        .storage()
        .store(session, StorageScope::Input, "old.txt", Bytes::from_static(b"old"))
        .await
        .unwrap();
    let job = harness
        .store
        .create(NewJob {
            session_id: session,
            tool: ToolId::PdfCompress,
            inputs: vec![input],
            options: ToolOptions::new(),
            owner: "previous-run".into(),
            tier: PlanTier::Pro,
            priority: 0,
            max_attempts: 3,
        })
        .unwrap();
    assert_eq!(harness.engine.queue_depth(), 0);

    harness.start().await;
    let done = harness.wait_terminal(job.id).await;
    assert_eq!(done.state, JobState::Completed);

    harness.shutdown().await;
}

#[tokio::test]
async fn shutdown_waits_for_workers() {
    let harness = TestHarness::new();
    harness.start().await;
    let job = harness.submit(ToolId::PdfCompress, &["last"]).await;
    harness.wait_terminal(job.id).await;

    tokio::time::timeout(Duration::from_secs(5), harness.shutdown())
        .await
        .expect("shutdown hung");
}
