//! Counter store trait for abstracting the shared store implementations.

use async_trait::async_trait;

use crate::error::StoreError;

/// Trait for the store that holds every key's window record.
///
/// This trait abstracts over the Redis store used in production and the
/// in-process store used for single-node deployments and tests. Each
/// operation must run as one indivisible unit with respect to every other
/// operation on the same key; the limiter takes no lock of its own.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Prune expired entries, then record `now` if fewer than `limit` remain.
    ///
    /// Returns `true` if the request was admitted.
    async fn admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<bool, StoreError>;

    /// Prune expired entries and report `limit` minus what is left, floored at zero.
    async fn remaining(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<u64, StoreError>;

    /// Cheap readiness probe, consulted before every admission attempt.
    ///
    /// Must not perform a round-trip.
    fn is_ready(&self) -> bool;

    /// Called by the limiter when a call timed out on its side.
    ///
    /// A single timeout should not take the store out of rotation; stores
    /// decide how many in a row they tolerate.
    fn record_failure(&self) {}

    /// Round-trip health check.
    async fn health(&self) -> Result<(), StoreError>;
}
