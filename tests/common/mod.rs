//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which wires an in-memory store, temp-dir file
//! storage and stub tool handlers into an [`Engine`] and an Axum router.
//! Workers only run after [`TestHarness::start`].

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use tm_core::config::Config;
use tm_core::{Error, Job, JobId, PlanTier, Result, ToolId, ToolOptions};
use tm_db::SqliteJobStore;
use tm_engine::engine::Upload;
use tm_engine::tools::ProgressSink;
use tm_engine::{
    Engine, EngineConfig, LocalStorage, ToolHandler, ToolInput, ToolOutput, ToolRegistry,
};
use tm_server::context::AppContext;
use tm_server::router::build_router;
use tokio::sync::Semaphore;
use tower::ServiceExt;

/// Multipart boundary used by [`multipart_body`].
pub const BOUNDARY: &str = "tm-test-boundary";

// ---------------------------------------------------------------------------
// Stub handlers
// ---------------------------------------------------------------------------

/// Uppercases the input and reports half-way progress.
pub struct Upper;

#[async_trait]
impl ToolHandler for Upper {
    fn name(&self) -> &str {
        "upper"
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _options: &ToolOptions,
        progress: &dyn ProgressSink,
    ) -> Result<ToolOutput> {
        progress.report(50);
        Ok(ToolOutput::new(
            format!("out-{}", input.name),
            input.data.to_ascii_uppercase(),
        ))
    }
}

/// Fails every call and counts them.
#[derive(Default)]
pub struct AlwaysFails {
    pub calls: AtomicU32,
}

#[async_trait]
impl ToolHandler for AlwaysFails {
    fn name(&self) -> &str {
        "always-fails"
    }

    async fn execute(
        &self,
        _input: &ToolInput,
        _options: &ToolOptions,
        _progress: &dyn ProgressSink,
    ) -> Result<ToolOutput> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(Error::tool("always-fails", format!("call {n} failed")))
    }
}

/// Fails the first `failures` calls, then echoes.
pub struct Flaky {
    pub failures: u32,
    pub calls: AtomicU32,
}

impl Flaky {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ToolHandler for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _options: &ToolOptions,
        _progress: &dyn ProgressSink,
    ) -> Result<ToolOutput> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(Error::tool("flaky", "transient failure"));
        }
        Ok(ToolOutput::new(input.name.clone(), input.data.clone()))
    }
}

/// Blocks each file until the test releases a permit.
pub struct Gated {
    pub permits: Arc<Semaphore>,
}

#[async_trait]
impl ToolHandler for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _options: &ToolOptions,
        progress: &dyn ProgressSink,
    ) -> Result<ToolOutput> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        permit.forget();
        progress.report(50);
        Ok(ToolOutput::new(input.name.clone(), input.data.clone()))
    }
}

/// First call reaches 100 and then fails; later calls report progress
/// slowly over `steps × step`. Tracks overlapping executions.
pub struct SlowRetry {
    pub steps: u8,
    pub step: Duration,
    pub calls: AtomicU32,
    pub running: AtomicU32,
    pub max_running: AtomicU32,
}

impl SlowRetry {
    pub fn new(steps: u8, step: Duration) -> Self {
        Self {
            steps,
            step,
            calls: AtomicU32::new(0),
            running: AtomicU32::new(0),
            max_running: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ToolHandler for SlowRetry {
    fn name(&self) -> &str {
        "slow-retry"
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _options: &ToolOptions,
        progress: &dyn ProgressSink,
    ) -> Result<ToolOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let outcome = if call == 0 {
            progress.report(100);
            Err(Error::tool("slow-retry", "failed after finishing"))
        } else {
            for i in 1..=self.steps {
                tokio::time::sleep(self.step).await;
                progress.report((u32::from(i) * 100 / u32::from(self.steps)) as u8);
            }
            Ok(ToolOutput::new(input.name.clone(), input.data.clone()))
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Fails on `b.txt` the first time it sees it; echoes everything else.
#[derive(Default)]
pub struct FailsOnSecondFile {
    pub failed: AtomicU32,
}

#[async_trait]
impl ToolHandler for FailsOnSecondFile {
    fn name(&self) -> &str {
        "fails-on-second-file"
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _options: &ToolOptions,
        _progress: &dyn ProgressSink,
    ) -> Result<ToolOutput> {
        if input.name == "b.txt" && self.failed.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::tool("fails-on-second-file", "b.txt rejected"));
        }
        Ok(ToolOutput::new(input.name.clone(), input.data.clone()))
    }
}

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

/// Stub handlers registered by [`TestHarness::new`].
pub struct Stubs {
    pub failing: Arc<AlwaysFails>,
    pub flaky: Arc<Flaky>,
    pub gate: Arc<Semaphore>,
    pub slow_retry: Arc<SlowRetry>,
    pub partial: Arc<FailsOnSecondFile>,
}

/// Engine, store and router over an in-memory database.
///
/// Tool wiring: `pdf-compress` uppercases, `img-compress` always fails,
/// `pdf-repair` fails once then succeeds, `video-trim` waits on
/// [`Stubs::gate`], `video-compress` runs [`SlowRetry`] and `img-resize`
/// runs [`FailsOnSecondFile`]. Everything else has no handler.
pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub store: Arc<SqliteJobStore>,
    pub config: Config,
    pub stubs: Stubs,
    pub dir: tempfile::TempDir,
}

/// Defaults tuned so retries finish quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.workers.backoff_base_ms = 20;
    config.workers.backoff_max_ms = 200;
    config.server.requests_per_minute = 0;
    config
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = Arc::new(SqliteJobStore::in_memory().expect("failed to create store"));

        let stubs = Stubs {
            failing: Arc::new(AlwaysFails::default()),
            flaky: Arc::new(Flaky::new(1)),
            gate: Arc::new(Semaphore::new(0)),
            slow_retry: Arc::new(SlowRetry::new(10, Duration::from_millis(300))),
            partial: Arc::new(FailsOnSecondFile::default()),
        };
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolId::PdfCompress, Arc::new(Upper))
            .register(ToolId::ImgCompress, stubs.failing.clone())
            .register(ToolId::PdfRepair, stubs.flaky.clone())
            .register(
                ToolId::VideoTrim,
                Arc::new(Gated {
                    permits: stubs.gate.clone(),
                }),
            )
            .register(ToolId::VideoCompress, stubs.slow_retry.clone())
            .register(ToolId::ImgResize, stubs.partial.clone());

        let engine = Engine::new(
            EngineConfig::from(&config),
            store.clone(),
            Arc::new(LocalStorage::new(dir.path())),
            registry,
        );

        Self {
            engine: Arc::new(engine),
            store,
            config,
            stubs,
            dir,
        }
    }

    /// Recover and start the worker pool.
    pub async fn start(&self) {
        self.engine.start().await.expect("engine failed to start");
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    pub fn router(&self) -> Router {
        build_router(AppContext::new(self.engine.clone(), self.config.clone()))
    }

    /// Submit text files for `tool` as an unlimited-tier caller.
    pub async fn submit(&self, tool: ToolId, files: &[&str]) -> Job {
        self.engine
            .submit_upload(upload(tool, "harness", PlanTier::Unlimited, files))
            .await
            .expect("submission rejected")
    }

    /// Poll until the job is terminal.
    pub async fn wait_terminal(&self, id: JobId) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.engine.status(id).expect("job vanished");
            if job.is_terminal() {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} still {} after 10s",
                job.state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Send one request through the router.
    pub async fn request(&self, request: Request<Body>) -> axum::response::Response {
        self.router().oneshot(request).await.expect("router failed")
    }
}

/// An upload of small text files named after their contents.
pub fn upload(tool: ToolId, owner: &str, tier: PlanTier, files: &[&str]) -> Upload {
    Upload {
        tool,
        files: files
            .iter()
            .map(|text| (format!("{text}.txt"), Bytes::copy_from_slice(text.as_bytes())))
            .collect(),
        options: ToolOptions::new(),
        tier,
        owner: owner.into(),
    }
}

/// Build a `multipart/form-data` body with optional `tool` and `options`
/// fields and one `files` part per entry.
pub fn multipart_body(
    tool: Option<&str>,
    options: Option<&str>,
    files: &[(&str, &str)],
) -> Vec<u8> {
    let mut body = Vec::new();
    let mut text_field = |name: &str, value: &str| {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    };
    if let Some(tool) = tool {
        text_field("tool", tool);
    }
    if let Some(options) = options {
        text_field("options", options);
    }
    for (name, data) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// `POST /api/process` request with caller headers.
pub fn process_request(body: Vec<u8>, tier: &str, client: &str) -> Request<Body> {
    Request::post("/api/process")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header("x-plan-tier", tier)
        .header("x-client-id", client)
        .body(Body::from(body))
        .expect("valid request")
}

pub async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body read failed")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is not JSON")
}

/// Parse `event:`/`data:` pairs out of a complete SSE body.
pub fn sse_events(raw: &str) -> Vec<(String, serde_json::Value)> {
    let mut events = Vec::new();
    for block in raw.split("\n\n") {
        let mut name = None;
        let mut data = None;
        for line in block.lines() {
            if let Some(v) = line.strip_prefix("event:") {
                name = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("data:") {
                data = serde_json::from_str(v.trim()).ok();
            }
        }
        if let (Some(name), Some(data)) = (name, data) {
            events.push((name, data));
        }
    }
    events
}
