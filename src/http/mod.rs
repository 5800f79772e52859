//! HTTP integration: identity resolution, the rate limiting middleware and
//! the server that hosts it.

mod identity;
mod middleware;
mod server;

pub use identity::{
    extract_origin, resolve_identity, AnonymousResolver, HeaderIdentityResolver, IdentityError,
    IdentityResolver,
};
pub use middleware::{
    rate_limit_middleware, RateLimitState, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING,
    REJECTION_MESSAGE,
};
pub use server::{build_router, HttpServer};
