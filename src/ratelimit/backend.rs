//! Storage contract for token buckets.
//!
//! A store keeps one value per identifier: the reference time at which the
//! bucket was last considered full. It never sees token counts or refill
//! rates; the [`RateLimiter`](super::RateLimiter) converts those into seconds
//! before calling in.

use async_trait::async_trait;
use std::cmp::Ordering;

use super::clock::compare_times;
use crate::error::Result;

/// What a store should do when `try_consume` finds no record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bootstrap {
    /// Create the record so that `remaining_seconds` of accrual are left
    /// after this consumption, and grant it.
    Seed { remaining_seconds: f64 },
    /// Deny without creating anything.
    Refuse,
}

/// A single consumption attempt, expressed in seconds of accrual.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeRequest {
    /// Seconds of accrual the caller wants to spend
    pub requested_seconds: f64,
    /// Seconds of accrual in a full bucket
    pub full_seconds: f64,
    /// Action to take for a previously unseen identifier
    pub bootstrap: Bootstrap,
}

/// Decide a consumption against an existing record.
///
/// Returns the new reference time when the request is granted, or `None`
/// when fewer than `requested_seconds` have accrued. Accrual is capped at
/// `full_seconds`, so idle time beyond a full bucket is discarded.
pub fn settle(reference_time: f64, now: f64, requested_seconds: f64, full_seconds: f64) -> Option<f64> {
    let available = (now - reference_time).min(full_seconds);
    if compare_times(requested_seconds, available) == Ordering::Greater {
        return None;
    }
    Some(now - available + requested_seconds)
}

/// Accrued seconds for a record, capped at a full bucket.
pub fn accrued(reference_time: f64, now: f64, full_seconds: f64) -> f64 {
    (now - reference_time).min(full_seconds).max(0.0)
}

/// Trait for bucket storage implementations.
///
/// Implementations must make `try_consume` atomic per identifier: two
/// concurrent calls for the same identifier behave as if run one after the
/// other. Different identifiers must not contend with each other.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Create whatever persistent structure the store needs. Idempotent.
    ///
    /// This is a host setup step; nothing in the limiter calls it.
    async fn prepare(&self) -> Result<()>;

    /// Create a record for `identifier` with the given reference time.
    ///
    /// Returns `false` without touching the existing record if one is
    /// already present.
    async fn bootstrap(&self, identifier: &str, reference_time: f64) -> Result<bool>;

    /// Atomically check and spend accrual for `identifier`.
    ///
    /// Returns `Ok(false)` when the bucket cannot cover the request. Storage
    /// faults are returned as errors, never as a denial.
    async fn try_consume(&self, identifier: &str, request: &ConsumeRequest) -> Result<bool>;

    /// Currently accrued seconds for `identifier`, capped at `full_seconds`.
    ///
    /// This is a plain read with no locking. `None` means no record exists.
    async fn available_seconds(&self, identifier: &str, full_seconds: f64) -> Result<Option<f64>>;
}
