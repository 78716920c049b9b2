//! Route handlers for the HTTP API.

pub mod events;
pub mod health;
pub mod process;
pub mod status;
pub mod tools;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tm_core::PlanTier;

use crate::error::AppError;

/// Header carrying the caller's plan tier.
pub const X_PLAN_TIER: &str = "x-plan-tier";
/// Header identifying the caller for quota accounting.
pub const X_CLIENT_ID: &str = "x-client-id";

/// Owner used when no client id is sent.
pub const ANONYMOUS: &str = "anonymous";

/// Who is submitting, taken from request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub tier: PlanTier,
    pub owner: String,
}

impl Caller {
    pub fn from_headers(headers: &HeaderMap) -> tm_core::Result<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let tier = match header(X_PLAN_TIER) {
            Some(raw) => raw.parse()?,
            None => PlanTier::default(),
        };
        let owner = header(X_CLIENT_ID).unwrap_or(ANONYMOUS).to_string();
        Ok(Self { tier, owner })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers)?)
    }
}
