//! Fast shared store boundary (counters, score-ordered sets, expiring values).
//!
//! Every operation is a single atomic round trip against the store. Callers
//! never read-modify-write; correctness under concurrency rests on the store.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use in_memory::InMemoryFastStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisFastStore;

#[derive(Debug, Error)]
pub enum FastStoreError {
    #[error("fast store connection error: {0}")]
    Connection(String),

    #[error("fast store command failed: {0}")]
    Command(String),

    /// A key holds a value of the wrong shape (e.g. a non-integer counter).
    #[error("unexpected value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// One write in a batch applied with [`FastStore::apply_batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Set { key: String, value: String },
    ZAdd { key: String, member: String, score: f64 },
    Delete { key: String },
}

#[async_trait]
pub trait FastStore: Send + Sync {
    /// Atomically decrement an existing integer counter by `by` and return the
    /// new value. `Ok(None)` when the counter does not exist; it is not created.
    async fn decr_existing(&self, key: &str, by: i64) -> Result<Option<i64>, FastStoreError>;

    /// Atomically increment an integer counter (created at 0 if missing).
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, FastStoreError>;

    /// Atomically add `by` to `member`'s score and return the new score.
    async fn zincr_by(&self, key: &str, member: &str, by: f64) -> Result<f64, FastStoreError>;

    /// Up to `limit` members, highest score first.
    async fn zrevrange_with_scores(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, FastStoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, FastStoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), FastStoreError>;

    /// Apply all operations in order, as one atomic round trip.
    async fn apply_batch(&self, ops: &[BatchOp]) -> Result<(), FastStoreError>;
}
