//! Job submission.
//!
//! Accepts a multipart form with a `tool` field, an optional `options` JSON
//! object and one or more `files` parts.

use axum::extract::multipart::MultipartError;
use axum::extract::{Extension, Multipart, State};
use axum::Json;
use bytes::Bytes;
use serde::Serialize;
use tm_core::{Error, ToolId, ToolOptions};
use tm_engine::engine::Upload;

use super::Caller;
use crate::context::AppContext;
use crate::error::AppError;
use crate::middleware::request_id::RequestId;

/// Multipart form accepted by `POST /api/process`.
#[derive(Debug, utoipa::ToSchema)]
#[allow(dead_code)]
pub struct ProcessForm {
    /// Tool id, e.g. `pdf-compress`.
    pub tool: String,
    /// JSON object passed to the tool.
    pub options: Option<String>,
    /// Files to process, in order.
    pub files: Vec<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub success: bool,
    pub job_id: String,
    pub session_id: String,
    pub status: String,
    pub message: String,
}

/// Form contents before validation.
#[derive(Debug, Default)]
struct ProcessParts {
    tool: Option<String>,
    options: Option<String>,
    files: Vec<(String, Bytes)>,
}

fn invalid_upload(e: MultipartError) -> Error {
    Error::Validation(format!("Invalid upload: {}", e.body_text()))
}

async fn read_form(multipart: &mut Multipart) -> tm_core::Result<ProcessParts> {
    let mut parts = ProcessParts::default();

    while let Some(field) = multipart.next_field().await.map_err(invalid_upload)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "tool" => parts.tool = Some(field.text().await.map_err(invalid_upload)?),
            "options" => parts.options = Some(field.text().await.map_err(invalid_upload)?),
            "files" | "files[]" | "file" => {
                let file_name = field.file_name().unwrap_or("file").to_string();
                let data = field.bytes().await.map_err(invalid_upload)?;
                parts.files.push((file_name, data));
            }
            other => tracing::debug!(field = other, "Ignoring unknown form field"),
        }
    }

    Ok(parts)
}

/// Parse the `options` field; blank means no options.
pub fn parse_options(raw: Option<&str>) -> tm_core::Result<ToolOptions> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(ToolOptions::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::Validation("options must be a JSON object".into())),
        Err(e) => Err(Error::Validation(format!("options is not valid JSON: {e}"))),
    }
}

fn build_upload(parts: ProcessParts, caller: Caller) -> tm_core::Result<Upload> {
    let tool: ToolId = parts
        .tool
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Validation("No tool specified".into()))?
        .parse()?;
    let options = parse_options(parts.options.as_deref())?;
    if parts.files.is_empty() {
        return Err(Error::Validation("No files provided".into()));
    }

    Ok(Upload {
        tool,
        files: parts.files,
        options,
        tier: caller.tier,
        owner: caller.owner,
    })
}

/// POST /api/process
#[utoipa::path(
    post,
    path = "/api/process",
    request_body(content = ProcessForm, content_type = "multipart/form-data"),
    params(
        ("x-plan-tier" = Option<String>, Header, description = "free, pro or unlimited"),
        ("x-client-id" = Option<String>, Header, description = "Caller identity for quotas"),
    ),
    responses(
        (status = 200, description = "Job queued", body = ProcessResponse),
        (status = 400, description = "Invalid submission or too many files"),
        (status = 413, description = "A file exceeds the plan limit"),
        (status = 429, description = "Daily quota or concurrency limit reached"),
    )
)]
pub async fn process(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    caller: Caller,
    mut multipart: Multipart,
) -> Result<Json<ProcessResponse>, AppError> {
    let with_id = |e: Error| AppError::from(e).with_request_id(request_id.0.clone());

    let parts = read_form(&mut multipart).await.map_err(with_id)?;
    let upload = build_upload(parts, caller).map_err(with_id)?;
    let job = ctx.engine.submit_upload(upload).await.map_err(with_id)?;

    Ok(Json(ProcessResponse {
        success: true,
        job_id: job.id.to_string(),
        session_id: job.session_id.to_string(),
        status: job.state.to_string(),
        message: "Files uploaded successfully. Processing started.".into(),
    }))
}
