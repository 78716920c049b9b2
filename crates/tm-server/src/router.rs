//! Axum router construction.
//!
//! Builds the application router with its route groups and middleware
//! layers.

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::context::AppContext;
use crate::middleware::rate_limit::{create_limiter, rate_limit_middleware};
use crate::middleware::request_id::request_id_middleware;
use crate::routes;

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::health::health_check,
        routes::process::process,
        routes::status::get_status,
        routes::tools::list_tools,
    ),
    components(schemas(
        routes::health::HealthResponse,
        routes::process::ProcessForm,
        routes::process::ProcessResponse,
        routes::status::JobStatusResponse,
        routes::tools::ToolResponse,
        tm_core::FileRef,
    ))
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let allow_origin = match origin.map(HeaderValue::from_str) {
        Some(Ok(value)) => AllowOrigin::exact(value),
        Some(Err(e)) => {
            tracing::warn!("Ignoring invalid cors_origin: {e}");
            AllowOrigin::any()
        }
        None => AllowOrigin::any(),
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let server = &ctx.config.server;
    let upload_limit = usize::try_from(server.max_upload_bytes).unwrap_or(usize::MAX);

    let upload_routes = Router::new()
        .route("/process", post(routes::process::process))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(upload_limit));

    let mut api = Router::new()
        .merge(upload_routes)
        .route("/status/{id}", get(routes::status::get_status))
        .route("/jobs/{id}/events", get(routes::events::job_events))
        .route("/events", get(routes::events::events_handler))
        .route("/tools", get(routes::tools::list_tools))
        .route("/openapi.json", get(openapi_json));

    if let Some(limiter) = create_limiter(server.requests_per_minute) {
        api = api
            .layer(middleware::from_fn(rate_limit_middleware))
            .layer(Extension(limiter));
    }

    let cors = cors_layer(server.cors_origin.as_deref());

    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api", api)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
