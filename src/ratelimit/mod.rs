//! Sliding-window rate limiting over a shared counter store.

mod backend;
mod clock;
mod degraded;
mod key;
mod limiter;
mod memory;
mod redis_store;
mod window;

pub use backend::CounterStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use degraded::DegradedPolicy;
pub use key::{normalize_origin, Identity, RateLimitKey};
pub use limiter::RateLimiter;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use window::SlidingWindow;
