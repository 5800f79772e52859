//! Redis-backed counter store.
//!
//! Each key's window record is a Redis list of epoch-millisecond strings,
//! oldest at the head. Both operations run as Lua scripts, so Redis executes
//! prune, count and append as a single unit that no other client command can
//! interleave with. The scripts apply the same expiry rule as
//! [`SlidingWindow`](super::window::SlidingWindow).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, RedisError, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::backend::CounterStore;
use crate::error::StoreError;

/// How long the store reports itself not ready after a failure.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Bound on connecting and on each command round-trip.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Consecutive timeouts tolerated before the store is skipped.
const TIMEOUTS_BEFORE_UNAVAILABLE: u32 = 3;

/// Minimum time an idle record outlives its window.
const MIN_EXPIRY_SLACK_MS: u64 = 1_000;

/// KEYS[1] = record, ARGV = now, window, limit, ttl. Returns 1 if admitted.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

while true do
  local oldest = redis.call('LINDEX', key, 0)
  if not oldest then break end
  if now - tonumber(oldest) > window then
    redis.call('LPOP', key)
  else
    break
  end
end

if redis.call('LLEN', key) < limit then
  redis.call('RPUSH', key, ARGV[1])
  redis.call('PEXPIRE', key, ARGV[4])
  return 1
end
return 0
"#;

/// KEYS[1] = record, ARGV = now, window, limit. Returns the remaining quota.
const REMAINING_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

while true do
  local oldest = redis.call('LINDEX', key, 0)
  if not oldest then break end
  if now - tonumber(oldest) > window then
    redis.call('LPOP', key)
  else
    break
  end
end

local remaining = limit - redis.call('LLEN', key)
if remaining < 0 then
  return 0
end
return remaining
"#;

/// Expiry set on a record after each append.
///
/// Callers stamp entries with their own clock, so a record must outlive its
/// window by enough to absorb round-trip latency and modest skew between
/// callers and Redis. Otherwise Redis could drop entries the window rule still
/// counts.
pub fn record_ttl_ms(window_ms: u64) -> u64 {
    window_ms.saturating_add(window_ms.max(MIN_EXPIRY_SLACK_MS))
}

/// Counter store backed by a shared Redis instance.
///
/// Construction only parses the URL. The connection is opened on first use
/// and shared by every caller afterwards; the connection manager reconnects
/// on its own once Redis is back.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    admit_script: Script,
    remaining_script: Script,
    /// Set while the store should be skipped in favour of the degraded policy
    failed_at: Mutex<Option<Instant>>,
    /// Timeouts since the last successful call
    timeouts: AtomicU32,
    retry_after: Duration,
    timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.connection.initialized())
            .field("failed_at", &*self.failed_at.lock())
            .field("timeouts", &self.timeouts.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the given Redis URL without connecting.
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            admit_script: Script::new(ADMIT_SCRIPT),
            remaining_script: Script::new(REMAINING_SCRIPT),
            failed_at: Mutex::new(None),
            timeouts: AtomicU32::new(0),
            retry_after: DEFAULT_RETRY_AFTER,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set how long to stay not-ready after a failure.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Set the bound on connecting and on each command round-trip.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Open the connection now instead of on the first request.
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.connection().await.map(|_| ())
    }

    /// A single connection attempt, bounded by the store timeout. Retrying is
    /// left to the readiness hold-off rather than the connection manager's
    /// backoff.
    fn manager_config(&self) -> ConnectionManagerConfig {
        let max_delay = u64::try_from(self.retry_after.as_millis()).unwrap_or(u64::MAX);
        ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_factor(100)
            .set_max_delay(max_delay)
            .set_connection_timeout(self.timeout)
            .set_response_timeout(self.timeout)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let manager =
                    ConnectionManager::new_with_config(self.client.clone(), self.manager_config())
                        .await?;
                info!("Connected to Redis counter store");
                Ok::<_, RedisError>(manager)
            })
            .await;

        match connection {
            Ok(conn) => Ok(conn.clone()),
            Err(e) => {
                let err = StoreError::from(e);
                if matches!(err, StoreError::Unavailable(_)) {
                    self.mark_unavailable();
                }
                Err(err)
            }
        }
    }

    /// Classify a failed command. A slow reply counts towards the timeout
    /// threshold; a lost connection makes the store unavailable at once.
    fn fail(&self, err: RedisError) -> StoreError {
        if err.is_timeout() {
            self.record_failure();
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            self.mark_unavailable();
        }
        err.into()
    }

    fn mark_unavailable(&self) {
        let mut failed_at = self.failed_at.lock();
        if failed_at.is_none() {
            warn!(retry_after = ?self.retry_after, "Redis counter store marked unavailable");
        } else {
            debug!("Redis counter store still unavailable");
        }
        *failed_at = Some(Instant::now());
    }

    fn succeed(&self) {
        self.timeouts.store(0, Ordering::Relaxed);
        let mut failed_at = self.failed_at.lock();
        if failed_at.take().is_some() {
            info!("Redis counter store recovered");
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let admitted: i64 = self
            .admit_script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(record_ttl_ms(window_ms))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;

        self.succeed();
        match admitted {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StoreError::Script(format!("unexpected admission result {}", other))),
        }
    }

    async fn remaining(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let remaining: i64 = self
            .remaining_script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;

        self.succeed();
        u64::try_from(remaining)
            .map_err(|_| StoreError::Script(format!("negative remaining quota {}", remaining)))
    }

    fn is_ready(&self) -> bool {
        match *self.failed_at.lock() {
            Some(at) => at.elapsed() >= self.retry_after,
            None => true,
        }
    }

    /// One slow reply does not take the store out of rotation; a run of
    /// `TIMEOUTS_BEFORE_UNAVAILABLE` does.
    fn record_failure(&self) {
        let timeouts = self.timeouts.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        if timeouts < TIMEOUTS_BEFORE_UNAVAILABLE {
            debug!(timeouts, "Redis counter store call timed out");
            return;
        }
        self.mark_unavailable();
    }

    async fn health(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;

        if pong != "PONG" {
            return Err(StoreError::Script(format!("unexpected PING reply {}", pong)));
        }
        self.succeed();
        Ok(())
    }
}
