//! In-process bucket store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::{accrued, settle, Bootstrap, BucketStore, ConsumeRequest};
use super::clock::{Clock, SystemClock};
use crate::error::Result;

/// A bucket store that keeps reference times in a concurrent map.
///
/// Each `try_consume` holds the map entry for its identifier for the whole
/// read-decide-write step, which serializes callers per identifier. State is
/// lost when the process exits, so this suits tests and single-process hosts.
pub struct MemoryBucketStore {
    buckets: DashMap<String, f64>,
    clock: Arc<dyn Clock>,
}

impl MemoryBucketStore {
    /// Create an empty store using the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Stored reference time for an identifier.
    pub fn reference_time(&self, identifier: &str) -> Option<f64> {
        self.buckets.get(identifier).map(|r| *r)
    }

    /// Number of bucket records.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn bootstrap(&self, identifier: &str, reference_time: f64) -> Result<bool> {
        match self.buckets.entry(identifier.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(reference_time);
                Ok(true)
            }
        }
    }

    async fn try_consume(&self, identifier: &str, request: &ConsumeRequest) -> Result<bool> {
        match self.buckets.entry(identifier.to_string()) {
            Entry::Vacant(slot) => match request.bootstrap {
                Bootstrap::Seed { remaining_seconds } => {
                    let reference_time = self.clock.now() - remaining_seconds;
                    debug!(identifier, reference_time, "Bootstrapping bucket");
                    slot.insert(reference_time);
                    Ok(true)
                }
                Bootstrap::Refuse => Ok(false),
            },
            Entry::Occupied(mut record) => {
                let now = self.clock.now();
                match settle(*record.get(), now, request.requested_seconds, request.full_seconds) {
                    Some(reference_time) => {
                        trace!(identifier, reference_time, "Consumed from bucket");
                        *record.get_mut() = reference_time;
                        Ok(true)
                    }
                    None => {
                        debug!(identifier, "Bucket exhausted");
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn available_seconds(&self, identifier: &str, full_seconds: f64) -> Result<Option<f64>> {
        let now = self.clock.now();
        Ok(self
            .reference_time(identifier)
            .map(|reference_time| accrued(reference_time, now, full_seconds)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::time::Duration;

    fn request(requested: f64, full: f64) -> ConsumeRequest {
        ConsumeRequest {
            requested_seconds: requested,
            full_seconds: full,
            bootstrap: Bootstrap::Seed {
                remaining_seconds: full - requested,
            },
        }
    }

    fn store_at(now: f64) -> (Arc<ManualClock>, MemoryBucketStore) {
        let clock = Arc::new(ManualClock::new(now));
        let store = MemoryBucketStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let store = MemoryBucketStore::new();
        store.prepare().await.unwrap();
        store.prepare().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_try_consume_seeds_missing_record() {
        let (_clock, store) = store_at(1000.0);

        assert!(store.try_consume("a", &request(0.2, 2.0)).await.unwrap());
        assert_eq!(store.reference_time("a"), Some(1000.0 - (2.0 - 0.2)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_try_consume_refuse_persists_nothing() {
        let (_clock, store) = store_at(1000.0);
        let refuse = ConsumeRequest {
            bootstrap: Bootstrap::Refuse,
            ..request(0.2, 2.0)
        };

        assert!(!store.try_consume("a", &refuse).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_try_consume_denial_leaves_record_unchanged() {
        let (_clock, store) = store_at(1000.0);
        store.bootstrap("a", 999.0).await.unwrap();

        assert!(!store.try_consume("a", &request(1.5, 2.0)).await.unwrap());
        assert_eq!(store.reference_time("a"), Some(999.0));
    }

    #[tokio::test]
    async fn test_try_consume_advances_reference_time() {
        let (clock, store) = store_at(1000.0);
        store.bootstrap("a", 999.0).await.unwrap();

        assert!(store.try_consume("a", &request(0.5, 2.0)).await.unwrap());
        assert_eq!(store.reference_time("a"), Some(999.5));

        clock.advance(Duration::from_secs(60));
        // Idle accrual capped at 2s: new reference = now - 2 + 0.5.
        assert!(store.try_consume("a", &request(0.5, 2.0)).await.unwrap());
        assert_eq!(store.reference_time("a"), Some(1058.5));
    }

    #[tokio::test]
    async fn test_bootstrap_does_not_overwrite() {
        let store = MemoryBucketStore::new();

        assert!(store.bootstrap("a", 10.0).await.unwrap());
        assert!(!store.bootstrap("a", 20.0).await.unwrap());
        assert_eq!(store.reference_time("a"), Some(10.0));
    }

    #[tokio::test]
    async fn test_available_seconds() {
        let (clock, store) = store_at(1000.0);
        assert_eq!(store.available_seconds("a", 2.0).await.unwrap(), None);

        store.bootstrap("a", 999.5).await.unwrap();
        assert_eq!(store.available_seconds("a", 2.0).await.unwrap(), Some(0.5));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.available_seconds("a", 2.0).await.unwrap(), Some(2.0));
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let (_clock, store) = store_at(1000.0);

        assert!(store.try_consume("a", &request(2.0, 2.0)).await.unwrap());
        assert!(!store.try_consume("a", &request(1.0, 2.0)).await.unwrap());
        assert!(store.try_consume("b", &request(2.0, 2.0)).await.unwrap());
        assert_eq!(store.len(), 2);
    }
}
