//! Job status pull.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use tm_core::{FileRef, Job, JobId, JobState};

use crate::context::AppContext;
use crate::error::AppError;

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub tool: String,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: String,
    pub updated_at: String,
    /// Output files, present once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<FileRef>>,
    /// The completed job's files again, under the key download clients read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_urls: Option<Vec<FileRef>>,
    /// Failure reason, present once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusResponse {
    pub fn from_job(job: &Job) -> Self {
        let result = match job.state {
            JobState::Completed => job.result.clone(),
            _ => None,
        };
        Self {
            job_id: job.id.to_string(),
            status: job.state.to_string(),
            tool: job.tool.to_string(),
            progress: job.progress,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
            download_urls: result.clone(),
            result,
            error: match job.state {
                JobState::Failed => job.failure_reason.clone(),
                _ => None,
            },
        }
    }
}

/// GET /api/status/{id}
#[utoipa::path(
    get,
    path = "/api/status/{id}",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Current job state", body = JobStatusResponse),
        (status = 400, description = "Malformed job id"),
        (status = 404, description = "No such job"),
    )
)]
pub async fn get_status(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let id = JobId::parse_param(&id)?;
    let job = ctx.engine.status(id)?;
    Ok(Json(JobStatusResponse::from_job(&job)))
}
