//! Core rate limiter implementation.

use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::{Bootstrap, BucketStore, ConsumeRequest};
use super::clock::TimeUnit;
use crate::config::BucketConfig;
use crate::error::{Result, TollgateError};

/// A token bucket whose state lives in a [`BucketStore`].
///
/// The limiter holds no clock state of its own. It turns token counts into
/// seconds of accrual and lets the store make the atomic decision, so any
/// number of limiters in any number of processes can share one store.
pub struct RateLimiter {
    /// Where bucket reference times are kept
    store: Arc<dyn BucketStore>,
    /// Maximum tokens a bucket can hold
    capacity: u64,
    /// Tokens added per second
    refill_rate: f64,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter holding up to `capacity` tokens and refilling at
    /// `refill_rate` tokens per second.
    pub fn new(store: Arc<dyn BucketStore>, capacity: u64, refill_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(TollgateError::InvalidConfiguration(
                "bucket capacity must be > 0".to_string(),
            ));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(TollgateError::InvalidConfiguration(format!(
                "refill rate must be a positive number of tokens per second, got {}",
                refill_rate
            )));
        }

        Ok(Self {
            store,
            capacity,
            refill_rate,
        })
    }

    /// Create a limiter refilling at `tokens` per `unit`.
    pub fn per_unit(
        store: Arc<dyn BucketStore>,
        capacity: u64,
        tokens: f64,
        unit: TimeUnit,
    ) -> Result<Self> {
        Self::new(store, capacity, unit.per_second(tokens))
    }

    /// Create a limiter from bucket configuration.
    pub fn from_config(store: Arc<dyn BucketStore>, config: &BucketConfig) -> Result<Self> {
        Self::per_unit(store, config.capacity, config.tokens_per_unit, config.unit)
    }

    /// Try to take `token_count` tokens from the bucket for `identifier`.
    ///
    /// Returns `Ok(true)` if all of them were taken and `Ok(false)` if none
    /// were. Requests larger than the bucket are denied without touching the
    /// store. An `Err` means the store failed, not that the caller is limited.
    pub async fn consume(&self, identifier: &str, token_count: u64) -> Result<bool> {
        if token_count > self.capacity {
            debug!(
                identifier,
                token_count,
                capacity = self.capacity,
                "Request exceeds bucket capacity"
            );
            return Ok(false);
        }
        if token_count == 0 {
            return Ok(true);
        }

        let request = ConsumeRequest {
            requested_seconds: self.tokens_to_seconds(token_count as f64),
            full_seconds: self.tokens_to_seconds(self.capacity as f64),
            bootstrap: Bootstrap::Seed {
                remaining_seconds: self.tokens_to_seconds((self.capacity - token_count) as f64),
            },
        };

        let granted = self.store.try_consume(identifier, &request).await?;
        trace!(identifier, token_count, granted, "Consume decision");
        Ok(granted)
    }

    /// Tokens currently available to `identifier`.
    ///
    /// An identifier that has never consumed anything has a full bucket.
    pub async fn remaining(&self, identifier: &str) -> Result<f64> {
        let full_seconds = self.tokens_to_seconds(self.capacity as f64);
        let available = self
            .store
            .available_seconds(identifier, full_seconds)
            .await?
            .unwrap_or(full_seconds);
        Ok(self.seconds_to_tokens(available))
    }

    /// Maximum tokens a bucket can hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn tokens_to_seconds(&self, tokens: f64) -> f64 {
        tokens / self.refill_rate
    }

    fn seconds_to_tokens(&self, seconds: f64) -> f64 {
        seconds * self.refill_rate
    }
}
