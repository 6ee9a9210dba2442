//! PostgreSQL bucket store.
//!
//! Each consumption runs in its own transaction. The bucket row is read with
//! `SELECT ... FOR UPDATE`, so concurrent callers for the same identifier
//! queue on the row lock while other identifiers proceed untouched. A missing
//! row is created with `INSERT ... ON CONFLICT DO NOTHING`; when a concurrent
//! caller wins that insert, the locking read is repeated against its row.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::backend::{accrued, settle, Bootstrap, BucketStore, ConsumeRequest};
use super::clock::{Clock, SystemClock};
use crate::config::DatabaseConfig;
use crate::error::{Result, TollgateError};

/// How many times a consumption retries after losing a bootstrap race.
const MAX_BOOTSTRAP_ATTEMPTS: u32 = 3;

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";
/// SQLSTATE raised when the bucket table is missing.
const UNDEFINED_TABLE: &str = "42P01";

/// Postgres identifiers longer than this are silently truncated.
const MAX_TABLE_NAME_LEN: usize = 63;

/// SQL statements for one bucket table.
#[derive(Debug, Clone)]
struct Queries {
    create: String,
    lock: String,
    select: String,
    insert: String,
    update: String,
}

impl Queries {
    fn new(table: &str) -> Self {
        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 identifier TEXT NOT NULL PRIMARY KEY, \
                 reference_time DOUBLE PRECISION NOT NULL)"
            ),
            lock: format!("SELECT reference_time FROM {table} WHERE identifier = $1 FOR UPDATE"),
            select: format!("SELECT reference_time FROM {table} WHERE identifier = $1"),
            insert: format!(
                "INSERT INTO {table} (identifier, reference_time) VALUES ($1, $2) \
                 ON CONFLICT (identifier) DO NOTHING"
            ),
            update: format!("UPDATE {table} SET reference_time = $2 WHERE identifier = $1"),
        }
    }
}

/// Check that a table name can be spliced into SQL as a bare identifier.
pub fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let starts_well = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !starts_well || !rest_ok || table.len() > MAX_TABLE_NAME_LEN {
        return Err(TollgateError::InvalidConfiguration(format!(
            "table name '{}' must match [A-Za-z_][A-Za-z0-9_]* and be at most {} characters",
            table, MAX_TABLE_NAME_LEN
        )));
    }
    Ok(())
}

/// Bucket store backed by a PostgreSQL table.
pub struct PgBucketStore {
    pool: Arc<PgPool>,
    table: String,
    queries: Queries,
    lock_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl PgBucketStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Arc<PgPool>, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            queries: Queries::new(table),
            lock_timeout: None,
            clock: Arc::new(SystemClock),
        })
    }

    /// Open a pool from configuration and wrap it in a store.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(
            table = %config.table_name,
            max_connections = config.max_connections,
            "Initializing PostgreSQL bucket store"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        let store = Self::new(Arc::new(pool), &config.table_name)?;
        Ok(match config.lock_timeout_ms {
            0 => store,
            ms => store.with_lock_timeout(Duration::from_millis(ms)),
        })
    }

    /// Give up waiting for a bucket row lock after `timeout`.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Use a different source of "now".
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Translate a database error from a bucket operation into the matching
    /// storage fault.
    fn classify(&self, identifier: &str, err: sqlx::Error) -> TollgateError {
        match sqlstate(&err).as_deref() {
            Some(LOCK_NOT_AVAILABLE) => {
                warn!(identifier, "Timed out waiting for bucket lock");
                TollgateError::LockTimeout {
                    identifier: identifier.to_string(),
                }
            }
            Some(UNDEFINED_TABLE) => {
                error!(table = %self.table, "Bucket table does not exist");
                TollgateError::SchemaMissing {
                    table: self.table.clone(),
                }
            }
            _ => {
                error!(identifier, "Database error during bucket operation: {}", err);
                TollgateError::Storage(err)
            }
        }
    }

    /// Translate a database error from a table-level operation.
    fn classify_schema(&self, err: sqlx::Error) -> TollgateError {
        error!(table = %self.table, "Database error preparing bucket table: {}", err);
        TollgateError::Storage(err)
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

#[async_trait]
impl BucketStore for PgBucketStore {
    async fn prepare(&self) -> Result<()> {
        info!(table = %self.table, "Preparing bucket table");
        sqlx::query(&self.queries.create)
            .execute(&*self.pool)
            .await
            .map_err(|e| self.classify_schema(e))?;
        Ok(())
    }

    async fn bootstrap(&self, identifier: &str, reference_time: f64) -> Result<bool> {
        let result = sqlx::query(&self.queries.insert)
            .bind(identifier)
            .bind(reference_time)
            .execute(&*self.pool)
            .await
            .map_err(|e| self.classify(identifier, e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_consume(&self, identifier: &str, request: &ConsumeRequest) -> Result<bool> {
        // Dropping the transaction on any early return rolls it back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| self.classify(identifier, e))?;

        // The retry after a lost bootstrap insert and the locking re-read both
        // need to see rows committed after the transaction began.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await
            .map_err(|e| self.classify(identifier, e))?;

        if let Some(timeout) = self.lock_timeout {
            sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis()))
                .execute(&mut *tx)
                .await
                .map_err(|e| self.classify(identifier, e))?;
        }

        for attempt in 1..=MAX_BOOTSTRAP_ATTEMPTS {
            let record = sqlx::query_scalar::<_, f64>(&self.queries.lock)
                .bind(identifier)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| self.classify(identifier, e))?;

            if let Some(reference_time) = record {
                let now = self.clock.now();
                let Some(next) = settle(
                    reference_time,
                    now,
                    request.requested_seconds,
                    request.full_seconds,
                ) else {
                    debug!(identifier, "Bucket exhausted");
                    tx.rollback().await.map_err(|e| self.classify(identifier, e))?;
                    return Ok(false);
                };

                sqlx::query(&self.queries.update)
                    .bind(identifier)
                    .bind(next)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| self.classify(identifier, e))?;
                tx.commit().await.map_err(|e| self.classify(identifier, e))?;

                trace!(identifier, reference_time = next, "Consumed from bucket");
                return Ok(true);
            }

            let remaining_seconds = match request.bootstrap {
                Bootstrap::Seed { remaining_seconds } => remaining_seconds,
                Bootstrap::Refuse => {
                    tx.rollback().await.map_err(|e| self.classify(identifier, e))?;
                    return Ok(false);
                }
            };

            let reference_time = self.clock.now() - remaining_seconds;
            let inserted = sqlx::query(&self.queries.insert)
                .bind(identifier)
                .bind(reference_time)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.classify(identifier, e))?
                .rows_affected();

            if inserted == 1 {
                tx.commit().await.map_err(|e| self.classify(identifier, e))?;
                debug!(identifier, reference_time, "Bootstrapped bucket");
                return Ok(true);
            }

            warn!(
                identifier,
                attempt, "Bucket was created concurrently, retrying against existing record"
            );
        }

        Err(TollgateError::BootstrapContention {
            identifier: identifier.to_string(),
        })
    }

    async fn available_seconds(&self, identifier: &str, full_seconds: f64) -> Result<Option<f64>> {
        let record = sqlx::query_scalar::<_, f64>(&self.queries.select)
            .bind(identifier)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| self.classify(identifier, e))?;

        let now = self.clock.now();
        Ok(record.map(|reference_time| accrued(reference_time, now, full_seconds)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_table_names() {
        assert!(validate_table_name("token_bucket").is_ok());
        assert!(validate_table_name("_buckets2").is_ok());
        assert!(validate_table_name(&"t".repeat(63)).is_ok());
    }

    #[test]
    fn test_invalid_table_names() {
        for name in ["", "2buckets", "token-bucket", "buckets; DROP TABLE x", "schema.table"] {
            assert!(
                matches!(
                    validate_table_name(name),
                    Err(TollgateError::InvalidConfiguration(_))
                ),
                "{name:?} should be rejected"
            );
        }
        assert!(validate_table_name(&"t".repeat(64)).is_err());
    }

    #[test]
    fn test_queries_target_table() {
        let queries = Queries::new("limits");

        assert!(queries.create.starts_with("CREATE TABLE IF NOT EXISTS limits"));
        assert!(queries.create.contains("identifier TEXT NOT NULL PRIMARY KEY"));
        assert!(queries.lock.ends_with("FOR UPDATE"));
        assert!(!queries.select.contains("FOR UPDATE"));
        assert!(queries.insert.contains("ON CONFLICT (identifier) DO NOTHING"));
        assert!(queries.update.starts_with("UPDATE limits"));
    }
}
