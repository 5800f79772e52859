//! Sliding-window admission over an ordered record of request timestamps.
//!
//! A window record holds one epoch-millisecond timestamp per admitted
//! request, oldest first. Every read or write of a record first prunes
//! expired entries from the head, so cleanup is amortized over normal
//! traffic and no background sweeper is needed.
//!
//! An entry is expired once `now - entry > window_ms`. An entry exactly
//! `window_ms` old still counts. If `now` moves backward between calls,
//! the subtraction saturates and pruning removes nothing.

use std::collections::VecDeque;

/// The admission rule for one limiter: at most `limit` entries inside any
/// trailing interval of `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    window_ms: u64,
    limit: u64,
}

impl SlidingWindow {
    /// Create a new sliding window rule.
    pub fn new(window_ms: u64, limit: u64) -> Self {
        Self { window_ms, limit }
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Admission threshold.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Whether an entry recorded at `entry` has aged out at `now`.
    pub fn is_expired(&self, entry: u64, now: u64) -> bool {
        now.saturating_sub(entry) > self.window_ms
    }

    /// Evict expired entries from the head of the record.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self, record: &mut VecDeque<u64>, now: u64) -> usize {
        let mut evicted = 0;
        while let Some(&oldest) = record.front() {
            if !self.is_expired(oldest, now) {
                break;
            }
            record.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Prune, then record `now` if the record still has room.
    ///
    /// Returns `true` if the request was admitted. A rejected request leaves
    /// the record exactly as pruning left it.
    pub fn admit(&self, record: &mut VecDeque<u64>, now: u64) -> bool {
        self.prune(record, now);
        if (record.len() as u64) < self.limit {
            record.push_back(now);
            true
        } else {
            false
        }
    }

    /// Prune, then report how many more requests fit in the window.
    pub fn remaining(&self, record: &mut VecDeque<u64>, now: u64) -> u64 {
        self.prune(record, now);
        self.limit.saturating_sub(record.len() as u64)
    }
}
