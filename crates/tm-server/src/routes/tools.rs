//! Tool catalog.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tm_core::ToolId;

use crate::context::AppContext;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ToolResponse {
    pub id: String,
    pub category: String,
    /// Whether a handler is registered; jobs for unavailable tools fail.
    pub available: bool,
}

/// GET /api/tools
#[utoipa::path(
    get,
    path = "/api/tools",
    responses(
        (status = 200, description = "Every tool in the catalog", body = Vec<ToolResponse>)
    )
)]
pub async fn list_tools(State(ctx): State<AppContext>) -> Json<Vec<ToolResponse>> {
    let registry = ctx.engine.registry();
    let tools = ToolId::ALL
        .iter()
        .map(|tool| ToolResponse {
            id: tool.to_string(),
            category: tool.category().to_string(),
            available: registry.contains(*tool),
        })
        .collect();
    Json(tools)
}
