//! Cache-aside read path for item details.
//!
//! Hits are served from the fast store. Misses read the durable item and hand
//! the write-back to a detached task, so the caller never waits on it. Each
//! entry expires after `base + U[0, jitter)`, which spreads out expiries of
//! entries written together.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use flashsale_core::ItemId;
use flashsale_inventory::Item;

use crate::fast_store::FastStore;
use crate::keys;
use crate::repository::{ItemRepository, StoreError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("item {0} not found")]
    NotFound(ItemId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub base: Duration,
    pub jitter: Duration,
}

impl TtlPolicy {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    /// A TTL drawn uniformly from `[base, base + jitter)`.
    pub fn sample(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

#[derive(Clone)]
pub struct CacheAside {
    store: Arc<dyn FastStore>,
    items: Arc<dyn ItemRepository>,
    ttl: TtlPolicy,
}

impl std::fmt::Debug for CacheAside {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAside")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl CacheAside {
    pub fn new(store: Arc<dyn FastStore>, items: Arc<dyn ItemRepository>, ttl: TtlPolicy) -> Self {
        Self { store, items, ttl }
    }

    #[instrument(skip_all, fields(item_id = %item_id), err)]
    pub async fn get_item_detail(&self, item_id: ItemId) -> Result<Item, CacheError> {
        let key = keys::item_detail(item_id);

        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Item>(&raw) {
                Ok(item) => {
                    debug!("item detail cache hit");
                    return Ok(item);
                }
                Err(err) => warn!(error = %err, "undecodable item detail entry; reading through"),
            },
            Ok(None) => debug!("item detail cache miss"),
            Err(err) => warn!(error = %err, "item detail cache unavailable; reading through"),
        }

        let item = self
            .items
            .find_item(item_id)
            .await?
            .ok_or(CacheError::NotFound(item_id))?;
        self.write_back(key, &item);
        Ok(item)
    }

    fn write_back(&self, key: String, item: &Item) {
        let value = match serde_json::to_string(item) {
            Ok(v) => v,
            Err(err) => {
                warn!(item_id = %item.id, error = %err, "item detail not cacheable");
                return;
            }
        };
        let ttl = self.ttl.sample();
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.set_ex(&key, &value, ttl).await {
                warn!(key = %key, error = %err, "item detail write-back failed");
            }
        });
    }
}
