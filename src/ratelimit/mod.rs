//! Token bucket rate limiting over pluggable storage.

mod backend;
mod clock;
mod limiter;
mod memory;
pub mod postgres;

pub use backend::{accrued, settle, Bootstrap, BucketStore, ConsumeRequest};
pub use clock::{compare_times, Clock, ManualClock, SystemClock, TimeUnit, TIME_EPSILON};
pub use limiter::RateLimiter;
pub use memory::MemoryBucketStore;
pub use postgres::PgBucketStore;

use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;

/// Open the bucket store selected by configuration.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn BucketStore>> {
    let store: Arc<dyn BucketStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryBucketStore::new()),
        StorageBackend::Postgres => Arc::new(PgBucketStore::connect(&config.database).await?),
    };
    Ok(store)
}
