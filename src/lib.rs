//! Slidegate - Distributed Sliding-Window Rate Limiting
//!
//! This crate enforces a per-identity request quota across any number of
//! stateless service processes. Each key's recent request history lives in a
//! shared Redis store, and admission decisions run there as atomic scripts,
//! so concurrent callers never overshoot the quota.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
