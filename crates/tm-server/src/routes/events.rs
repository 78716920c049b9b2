//! Server-Sent Events handlers.
//!
//! `GET /api/jobs/{id}/events` pushes one job's progress and ends after its
//! terminal event, or once the job is gone from the store. `GET /api/events`
//! is the admin firehose: recent events are replayed for late joiners, then
//! every new event, with heartbeats.

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use std::convert::Infallible;
use std::time::Duration;
use tm_core::events::{JobEvent, JobEventKind};
use tm_core::{Error, Job, JobId, JobState};
use tokio::sync::broadcast::error::RecvError;

use crate::context::AppContext;
use crate::error::AppError;

const HEARTBEAT: Duration = Duration::from_secs(15);
/// How often a per-job stream re-reads the stored job.
const RECHECK: Duration = Duration::from_secs(15);
const REPLAY: usize = 50;

fn sse_event(event: &JobEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Event::default().event(event.name()).data(data)),
        Err(e) => {
            tracing::warn!(job_id = %event.job_id, error = %e, "Failed to encode event");
            None
        }
    }
}

/// The event a finished job ended with, rebuilt from its stored state.
pub fn terminal_event(job: &Job) -> Option<JobEvent> {
    let kind = match job.state {
        JobState::Completed => JobEventKind::Completed {
            result: job.result.clone().unwrap_or_default(),
        },
        JobState::Failed => JobEventKind::Failed {
            reason: job
                .failure_reason
                .clone()
                .unwrap_or_else(|| "Processing failed".into()),
        },
        JobState::Queued | JobState::Active => return None,
    };
    Some(JobEvent {
        job_id: job.id,
        timestamp: job.updated_at,
        kind,
    })
}

/// GET /api/jobs/{id}/events
pub async fn job_events(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let id = JobId::parse_param(&id)?;
    let (job, mut subscription) = ctx.engine.watch(id)?;

    let stream = async_stream::stream! {
        if let Some(event) = terminal_event(&job) {
            if let Some(sse) = sse_event(&event) {
                yield Ok(sse);
            }
        } else {
            // Current position first, then only forward progress.
            let mut last = job.progress;
            let snapshot = JobEvent::new(job.id, JobEventKind::Progress { progress: last });
            if let Some(sse) = sse_event(&snapshot) {
                yield Ok(sse);
            }

            let mut recheck =
                tokio::time::interval_at(tokio::time::Instant::now() + RECHECK, RECHECK);

            loop {
                tokio::select! {
                    received = subscription.recv() => {
                        let Some(event) = received else { break };
                        if let JobEventKind::Progress { progress } = event.kind {
                            if progress <= last {
                                continue;
                            }
                            last = progress;
                        }
                        let terminal = event.is_terminal();
                        if let Some(sse) = sse_event(&event) {
                            yield Ok(sse);
                        }
                        if terminal {
                            break;
                        }
                    }
                    _ = recheck.tick() => {
                        match ctx.engine.status(id) {
                            Ok(current) => {
                                if let Some(event) = terminal_event(&current) {
                                    if let Some(sse) = sse_event(&event) {
                                        yield Ok(sse);
                                    }
                                    break;
                                }
                            }
                            Err(Error::NotFound { .. }) => {
                                tracing::debug!(job_id = %id, "Watched job was purged");
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(job_id = %id, error = %e, "Job recheck failed");
                            }
                        }
                    }
                }
            }
        }
        tracing::debug!(job_id = %id, "Job event stream closed");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT).text("ping")))
}

/// GET /api/events
pub async fn events_handler(
    State(ctx): State<AppContext>,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>> {
    let bus = ctx.engine.events();
    let mut rx = bus.subscribe_all();
    let recent = bus.recent_events(REPLAY);

    let stream = async_stream::stream! {
        for event in recent.iter().rev() {
            if let Some(sse) = sse_event(event) {
                yield Ok(sse);
            }
        }

        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + HEARTBEAT, HEARTBEAT);

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Some(sse) = sse_event(&event) {
                                yield Ok(sse);
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::debug!("SSE client lagged by {n} events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok(Event::default()
                        .event("heartbeat")
                        .data(r#"{"type":"heartbeat"}"#));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT).text("ping"))
}
