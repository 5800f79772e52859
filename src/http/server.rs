//! HTTP server implementation.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::middleware::{rate_limit_middleware, RateLimitState};
use crate::error::{Result, SlidegateError};

/// HTTP server that puts a set of routes behind the rate limiter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Limiter and identity resolution shared by every request
    state: RateLimitState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: RateLimitState) -> Self {
        Self { addr, state }
    }

    /// Build the full router: `routes` behind the limiter, plus an unlimited `/health`.
    pub fn router(&self, routes: Router) -> Router {
        build_router(self.state.clone(), routes)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, routes: Router, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router(routes);
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with rate limiting");

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                SlidegateError::Io(e)
            })
    }
}

/// Layer the rate limiter onto `routes` and add the health endpoint.
///
/// Only matched routes are limited, so unknown paths do not consume quota.
pub fn build_router(state: RateLimitState, routes: Router) -> Router {
    let limited = routes.route_layer(axum::middleware::from_fn_with_state(
        state.clone(),
        rate_limit_middleware,
    ));

    Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(limited)
}

async fn health(State(state): State<RateLimitState>) -> (StatusCode, Json<Value>) {
    match state.limiter.store_health().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok", "store": "up" }))),
        Err(e) => {
            warn!(error = %e, "Health check found store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "store": "down", "error": e.to_string() })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;
    use crate::error::StoreError;
    use crate::http::identity::AnonymousResolver;
    use crate::ratelimit::{CounterStore, MemoryStore, RateLimiter};
    use async_trait::async_trait;
    use axum::body::Body;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn admit(
            &self,
            _: &str,
            _: u64,
            _: u64,
            _: u64,
        ) -> std::result::Result<bool, StoreError> {
            Err(StoreError::Unavailable("refused".to_string()))
        }

        async fn remaining(
            &self,
            _: &str,
            _: u64,
            _: u64,
            _: u64,
        ) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("refused".to_string()))
        }

        fn is_ready(&self) -> bool {
            true
        }

        async fn health(&self) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("refused".to_string()))
        }
    }

    fn server(store: Arc<dyn CounterStore>, allow_if_store_down: bool) -> HttpServer {
        let config = LimiterConfig::new(1, 60_000, allow_if_store_down).unwrap();
        let limiter = Arc::new(RateLimiter::new(config, store).unwrap());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        HttpServer::new(addr, RateLimitState::new(limiter, Arc::new(AnonymousResolver)))
    }

    fn routes() -> Router {
        Router::new().route("/", get(|| async { "hello" }))
    }

    fn get_request(path: &str) -> axum::extract::Request {
        axum::http::Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_not_limited() {
        let app = server(Arc::new(MemoryStore::new()), false).router(routes());

        for _ in 0..3 {
            let response = app.clone().oneshot(get_request("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
    }

    #[tokio::test]
    async fn test_health_reports_store_down() {
        let app = server(Arc::new(UnreachableStore), true).router(routes());

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_store_down_rejects_with_429() {
        let app = server(Arc::new(UnreachableStore), false).router(routes());

        let response = app.oneshot(get_request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }

    #[tokio::test]
    async fn test_store_down_admits_when_allowed() {
        let app = server(Arc::new(UnreachableStore), true).router(routes());

        for _ in 0..5 {
            let response = app.clone().oneshot(get_request("/")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-remaining"], "1");
        }
    }

    #[tokio::test]
    async fn test_unknown_path_consumes_no_quota() {
        let app = server(Arc::new(MemoryStore::new()), false).router(routes());

        let missing = app.clone().oneshot(get_request("/missing")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get_request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let server = server(Arc::new(MemoryStore::new()), false);
        let result = server.serve_with_shutdown(routes(), async {}).await;
        assert!(result.is_ok());
    }
}
