//! Rate limiting middleware for axum routers.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, instrument};

use super::identity::{extract_origin, resolve_identity, IdentityResolver};
use crate::ratelimit::RateLimiter;

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Message returned with every 429.
pub const REJECTION_MESSAGE: &str = "Too many requests, please try again later.";

/// Everything the middleware needs per request.
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub trust_forwarded_for: bool,
}

impl RateLimitState {
    pub fn new(limiter: Arc<RateLimiter>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            limiter,
            resolver,
            trust_forwarded_for: false,
        }
    }

    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Admit or reject the request, tagging the response with quota headers
/// either way.
///
/// The remaining quota is read before the admission decision, so it reflects
/// the state before this request was counted.
#[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    req: Request,
    next: Next,
) -> Response {
    let identity = resolve_identity(state.resolver.as_ref(), req.headers()).await;
    let origin = extract_origin(&req, state.trust_forwarded_for);
    let key = state.limiter.generate_key(&identity, origin);

    let remaining = state.limiter.remaining_quota(&key).await;
    let admitted = state.limiter.should_proceed(&key).await;

    let mut response = if admitted {
        next.run(req).await
    } else {
        debug!(key = %key, "Rejecting request over quota");
        too_many_requests()
    };

    set_quota_headers(response.headers_mut(), state.limiter.rate_limit(), remaining);
    response
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": REJECTION_MESSAGE })),
    )
        .into_response()
}

fn set_quota_headers(headers: &mut HeaderMap, limit: u64, remaining: u64) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
}
