use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{BatchOp, FastStore, FastStoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn persistent(value: String) -> Self {
        Self {
            value,
            ttl: None,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, Entry>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|e| !e.is_live(now)) {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }

    fn counter(&mut self, key: &str) -> Result<Option<i64>, FastStoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(e) => e.value.parse::<i64>().map(Some).map_err(|err| FastStoreError::Corrupt {
                key: key.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    fn set_counter(&mut self, key: &str, value: i64) {
        let ttl_kept = self.live(key).map(|e| (e.ttl, e.expires_at));
        let (ttl, expires_at) = ttl_kept.unwrap_or((None, None));
        self.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                ttl,
                expires_at,
            },
        );
    }
}

/// In-memory fast store.
///
/// Intended for tests/dev. One mutex serializes every operation, which makes
/// each one atomic. Failure injection lets tests simulate an unreachable store.
#[derive(Debug, Default)]
pub struct InMemoryFastStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    batches: AtomicUsize,
}

impl InMemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a connection error (or stop doing so).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current integer value of a counter, if set.
    pub fn counter(&self, key: &str) -> Option<i64> {
        self.lock().counter(key).ok().flatten()
    }

    pub fn put_counter(&self, key: &str, value: i64) {
        self.lock().set_counter(key, value);
    }

    /// The TTL a key was last written with, if it is live and expiring.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.lock().live(key).and_then(|e| e.ttl)
    }

    pub fn score(&self, key: &str, member: &str) -> Option<f64> {
        self.lock().zsets.get(key).and_then(|z| z.get(member).copied())
    }

    /// Number of `apply_batch` round trips served so far.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_available(&self) -> Result<(), FastStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FastStoreError::Connection(
                "in-memory fast store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn decr_existing(&self, key: &str, by: i64) -> Result<Option<i64>, FastStoreError> {
        self.check_available()?;
        let mut state = self.lock();
        let Some(current) = state.counter(key)? else {
            return Ok(None);
        };
        let next = current
            .checked_sub(by)
            .ok_or_else(|| FastStoreError::Command(format!("decrement of {key} would overflow")))?;
        state.set_counter(key, next);
        Ok(Some(next))
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, FastStoreError> {
        self.check_available()?;
        let mut state = self.lock();
        let next = state
            .counter(key)?
            .unwrap_or(0)
            .checked_add(by)
            .ok_or_else(|| FastStoreError::Command(format!("increment of {key} would overflow")))?;
        state.set_counter(key, next);
        Ok(next)
    }

    async fn zincr_by(&self, key: &str, member: &str, by: f64) -> Result<f64, FastStoreError> {
        self.check_available()?;
        let mut state = self.lock();
        let score = state
            .zsets
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0.0);
        *score += by;
        Ok(*score)
    }

    async fn zrevrange_with_scores(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, FastStoreError> {
        self.check_available()?;
        let state = self.lock();
        let mut members: Vec<(String, f64)> = state
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        // Ties break on member, descending, as the sorted-set reverse range does.
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        members.truncate(limit);
        Ok(members)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, FastStoreError> {
        self.check_available()?;
        Ok(self.lock().live(key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), FastStoreError> {
        self.check_available()?;
        self.lock().strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                ttl: Some(ttl),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn apply_batch(&self, ops: &[BatchOp]) -> Result<(), FastStoreError> {
        self.check_available()?;
        let mut state = self.lock();
        for op in ops {
            match op {
                BatchOp::Set { key, value } => {
                    state
                        .strings
                        .insert(key.clone(), Entry::persistent(value.clone()));
                }
                BatchOp::ZAdd { key, member, score } => {
                    state
                        .zsets
                        .entry(key.clone())
                        .or_default()
                        .insert(member.clone(), *score);
                }
                BatchOp::Delete { key } => {
                    state.strings.remove(key);
                    state.zsets.remove(key);
                }
            }
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflowing_counter_updates_are_refused() {
        let store = InMemoryFastStore::new();
        store.put_counter("stock:1", i64::MIN + 1);
        assert!(matches!(
            store.decr_existing("stock:1", 2).await,
            Err(FastStoreError::Command(_))
        ));
        assert_eq!(store.counter("stock:1"), Some(i64::MIN + 1));

        store.put_counter("stock:2", i64::MAX);
        assert!(matches!(
            store.incr_by("stock:2", 1).await,
            Err(FastStoreError::Command(_))
        ));
        assert_eq!(store.counter("stock:2"), Some(i64::MAX));
    }

    #[tokio::test]
    async fn decr_existing_does_not_create_missing_counters() {
        let store = InMemoryFastStore::new();
        assert_eq!(store.decr_existing("stock:1", 1).await.unwrap(), None);
        assert_eq!(store.counter("stock:1"), None);

        store.put_counter("stock:1", 3);
        assert_eq!(store.decr_existing("stock:1", 2).await.unwrap(), Some(1));
        assert_eq!(store.decr_existing("stock:1", 2).await.unwrap(), Some(-1));
    }

    #[tokio::test]
    async fn non_integer_counter_is_corrupt() {
        let store = InMemoryFastStore::new();
        store
            .apply_batch(&[BatchOp::Set {
                key: "stock:1".into(),
                value: "lots".into(),
            }])
            .await
            .unwrap();
        assert!(matches!(
            store.incr_by("stock:1", 1).await,
            Err(FastStoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn reverse_range_orders_by_score() {
        let store = InMemoryFastStore::new();
        store.zincr_by("z", "a", 1.0).await.unwrap();
        store.zincr_by("z", "b", 5.0).await.unwrap();
        store.zincr_by("z", "c", 3.0).await.unwrap();
        store.zincr_by("z", "a", 1.0).await.unwrap();

        let top = store.zrevrange_with_scores("z", 2).await.unwrap();
        assert_eq!(top, vec![("b".to_string(), 5.0), ("c".to_string(), 3.0)]);
    }

    #[tokio::test]
    async fn expired_values_disappear() {
        let store = InMemoryFastStore::new();
        store.set_ex("k", "v", Duration::from_millis(10)).await.unwrap();
        assert_eq!(store.ttl_of("k"), Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryFastStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("k").await,
            Err(FastStoreError::Connection(_))
        ));
        store.set_unavailable(false);
        assert!(store.get("k").await.is_ok());
    }
}
