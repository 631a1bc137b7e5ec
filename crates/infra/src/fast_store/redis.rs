//! Redis-backed fast store.
//!
//! Uses one multiplexed [`ConnectionManager`] (reconnects on failure). The
//! conditional decrement runs as a Lua script so that "exists?" and "DECRBY"
//! are one atomic step on the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use tracing::instrument;

use super::{BatchOp, FastStore, FastStoreError};

const DECR_EXISTING_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return nil
end
return redis.call('DECRBY', KEYS[1], ARGV[1])
"#;

pub struct RedisFastStore {
    conn: ConnectionManager,
    decr_existing: Script,
}

impl std::fmt::Debug for RedisFastStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisFastStore").finish_non_exhaustive()
    }
}

impl RedisFastStore {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self, FastStoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| FastStoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| FastStoreError::Connection(e.to_string()))?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            decr_existing: Script::new(DECR_EXISTING_LUA),
        }
    }
}

fn map_redis_error(operation: &str, err: RedisError) -> FastStoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        FastStoreError::Connection(format!("{operation}: {err}"))
    } else if err.kind() == redis::ErrorKind::TypeError {
        FastStoreError::Corrupt {
            key: operation.to_string(),
            reason: err.to_string(),
        }
    } else {
        FastStoreError::Command(format!("{operation}: {err}"))
    }
}

#[async_trait]
impl FastStore for RedisFastStore {
    #[instrument(skip(self), err)]
    async fn decr_existing(&self, key: &str, by: i64) -> Result<Option<i64>, FastStoreError> {
        let mut conn = self.conn.clone();
        self.decr_existing
            .key(key)
            .arg(by)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("DECRBY", e))
    }

    #[instrument(skip(self), err)]
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, FastStoreError> {
        let mut conn = self.conn.clone();
        conn.incr(key, by)
            .await
            .map_err(|e| map_redis_error("INCRBY", e))
    }

    async fn zincr_by(&self, key: &str, member: &str, by: f64) -> Result<f64, FastStoreError> {
        let mut conn = self.conn.clone();
        conn.zincr(key, member, by)
            .await
            .map_err(|e| map_redis_error("ZINCRBY", e))
    }

    async fn zrevrange_with_scores(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, FastStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        conn.zrevrange_withscores(key, 0, stop)
            .await
            .map_err(|e| map_redis_error("ZREVRANGE", e))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, FastStoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| map_redis_error("GET", e))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), FastStoreError> {
        let mut conn = self.conn.clone();
        // PX keeps sub-second jitter.
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("SET PX", e))
    }

    #[instrument(skip(self, ops), fields(op_count = ops.len()), err)]
    async fn apply_batch(&self, ops: &[BatchOp]) -> Result<(), FastStoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                BatchOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
                BatchOp::ZAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
                }
                BatchOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("MULTI/EXEC", e))
    }
}
