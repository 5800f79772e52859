//! Rate limiter facade.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::backend::CounterStore;
use super::clock::{Clock, SystemClock};
use super::degraded::DegradedPolicy;
use super::key::{Identity, RateLimitKey};
use super::window::SlidingWindow;
use crate::config::LimiterConfig;
use crate::error::{Result, StoreError};

/// Default bound on a single store round-trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);
/// Default namespace for derived keys.
const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// The limiter the HTTP layer talks to.
///
/// Holds no counters itself. Every decision is made by the shared store, so
/// any number of processes can share one quota per key. Per-request store
/// failures never surface as errors; they are turned into a decision by the
/// degraded-mode policy.
pub struct RateLimiter {
    config: LimiterConfig,
    window: SlidingWindow,
    degraded: DegradedPolicy,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    store_timeout: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("key_prefix", &self.key_prefix)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter over the given store.
    ///
    /// Fails if the configuration would disable limiting.
    pub fn new(config: LimiterConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            window: SlidingWindow::new(config.window_size_ms, config.request_limit_per_window),
            degraded: DegradedPolicy::from_allow(config.allow_if_store_down),
            config,
            store,
            clock: Arc::new(SystemClock),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        })
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound each store call by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Namespace derived keys under `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Derive the key this request's quota is tracked against.
    pub fn generate_key(&self, identity: &Identity, origin: IpAddr) -> RateLimitKey {
        RateLimitKey::derive(&self.key_prefix, identity, origin)
    }

    /// Decide whether the request keyed by `key` is admitted, recording it if so.
    pub async fn should_proceed(&self, key: &RateLimitKey) -> bool {
        let now = self.clock.now_millis();
        let admit = self.store.admit(
            key.as_str(),
            now,
            self.window.window_ms(),
            self.window.limit(),
        );

        match self.call(admit).await {
            Ok(admitted) => {
                trace!(key = %key, now, admitted, "Admission decided");
                if !admitted {
                    debug!(key = %key, limit = self.window.limit(), "Rate limit exceeded");
                }
                admitted
            }
            Err(e) => {
                let admitted = self.degraded.admits();
                warn!(
                    key = %key,
                    error = %e,
                    policy = ?self.degraded,
                    admitted,
                    "Store unavailable, using degraded policy"
                );
                admitted
            }
        }
    }

    /// Requests left for `key` in the current window, before this request is counted.
    pub async fn remaining_quota(&self, key: &RateLimitKey) -> u64 {
        let now = self.clock.now_millis();
        let remaining = self.store.remaining(
            key.as_str(),
            now,
            self.window.window_ms(),
            self.window.limit(),
        );

        match self.call(remaining).await {
            Ok(remaining) => remaining.min(self.window.limit()),
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    policy = ?self.degraded,
                    "Store unavailable, reporting degraded quota"
                );
                self.degraded.remaining(self.window.limit())
            }
        }
    }

    /// The configured number of requests per window.
    pub fn rate_limit(&self) -> u64 {
        self.config.request_limit_per_window
    }

    /// Round-trip health of the shared store, bounded by the store timeout.
    pub async fn store_health(&self) -> std::result::Result<(), StoreError> {
        match tokio::time::timeout(self.store_timeout, self.store.health()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    /// Run one store operation unless the store is known to be down.
    ///
    /// A call that outlives the timeout is abandoned and reported to the
    /// store, which decides whether a run of them makes it unavailable.
    async fn call<T, F>(&self, operation: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        if !self.store.is_ready() {
            return Err(StoreError::Unavailable("store not ready".to_string()));
        }

        match tokio::time::timeout(self.store_timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                self.store.record_failure();
                Err(StoreError::Timeout(self.store_timeout))
            }
        }
    }
}
