//! Governor-based HTTP rate limiting.

use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::Arc;

/// A shared rate limiter instance.
pub type SharedLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Create a limiter for `requests_per_minute`; `None` when zero (disabled).
pub fn create_limiter(requests_per_minute: u32) -> Option<SharedLimiter> {
    let per_minute = NonZeroU32::new(requests_per_minute)?;
    Some(Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))))
}

/// Rate limiting middleware. Returns 429 Too Many Requests when exceeded.
pub async fn rate_limit_middleware(
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let limiter = request.extensions().get::<SharedLimiter>().cloned();

    if let Some(limiter) = limiter {
        if limiter.check().is_err() {
            tracing::debug!(path = %request.uri().path(), "HTTP rate limit exceeded");
            let body = json!({
                "success": false,
                "error": "Rate limit exceeded",
                "code": "rate_limited",
            });
            return Err((StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response());
        }
    }

    Ok(next.run(request).await)
}
