//! Component wiring: which backends to run on and the services built over them.

use std::sync::Arc;

use thiserror::Error;

use flashsale_core::{ConfigError, IdGenerator};
use flashsale_events::{InMemoryIntakeQueue, IntakeQueue, QueueError};

use crate::cache::{CacheAside, TtlPolicy};
use crate::checkout::CheckoutService;
use crate::config::AppConfig;
use crate::fast_store::{FastStore, FastStoreError, InMemoryFastStore};
use crate::gate::InventoryGate;
use crate::persister::OrderPersister;
use crate::ranking::RankingMaintainer;
use crate::repository::{InMemoryStore, ItemRepository, OrderRepository, StoreError};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("fast store unavailable: {0}")]
    FastStore(#[from] FastStoreError),

    #[error("intake queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("durable store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// The four external dependencies every component is built on.
#[derive(Clone)]
pub struct Backends {
    pub fast: Arc<dyn FastStore>,
    pub items: Arc<dyn ItemRepository>,
    pub orders: Arc<dyn OrderRepository>,
    pub queue: Arc<dyn IntakeQueue>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

impl Backends {
    /// Everything in process memory (dev and tests).
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            fast: Arc::new(InMemoryFastStore::new()),
            items: store.clone(),
            orders: store,
            queue: Arc::new(InMemoryIntakeQueue::new()),
        }
    }

    /// Redis for the fast store and the intake queue; Postgres for durable
    /// state when `DATABASE_URL` is set, in-memory durable state otherwise.
    #[cfg(feature = "redis")]
    pub async fn connect(config: &AppConfig) -> Result<Self, ContextError> {
        use crate::fast_store::RedisFastStore;
        use crate::intake::RedisStreamsQueue;
        use crate::repository::PostgresStore;

        let fast = Arc::new(RedisFastStore::connect(&config.redis_url).await?);
        let queue = Arc::new(RedisStreamsQueue::connect(&config.redis_url).await?);

        let (items, orders): (Arc<dyn ItemRepository>, Arc<dyn OrderRepository>) =
            match &config.database_url {
                Some(url) => {
                    let store = Arc::new(PostgresStore::connect(url).await?);
                    store.migrate().await?;
                    (store.clone(), store)
                }
                None => {
                    tracing::warn!("DATABASE_URL not set; durable state is kept in memory");
                    let store = Arc::new(InMemoryStore::new());
                    (store.clone(), store)
                }
            };

        Ok(Self {
            fast,
            items,
            orders,
            queue,
        })
    }
}

/// Every service of one process, sharing one id generator and one set of
/// backends.
#[derive(Clone)]
pub struct AppContext {
    pub config: AppConfig,
    pub ids: Arc<IdGenerator>,
    pub backends: Backends,
    pub gate: InventoryGate,
    pub ranking: RankingMaintainer,
    pub cache: CacheAside,
    pub persister: OrderPersister,
    pub checkout: CheckoutService,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub fn build(config: AppConfig, backends: Backends) -> Result<Self, ConfigError> {
        let ids = Arc::new(config.id_generator()?);

        let gate = InventoryGate::new(backends.fast.clone());
        let ranking = RankingMaintainer::new(backends.fast.clone(), backends.items.clone());
        let cache = CacheAside::new(
            backends.fast.clone(),
            backends.items.clone(),
            TtlPolicy::new(config.cache_ttl_base, config.cache_ttl_jitter),
        );
        let persister = OrderPersister::new(backends.orders.clone(), ids.clone());
        let checkout = CheckoutService::new(
            ids.clone(),
            gate.clone(),
            backends.queue.clone(),
            backends.items.clone(),
            backends.orders.clone(),
            ranking.clone(),
        );

        Ok(Self {
            config,
            ids,
            backends,
            gate,
            ranking,
            cache,
            persister,
            checkout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_on_in_memory_backends() {
        let ctx = AppContext::build(AppConfig::default(), Backends::in_memory()).unwrap();
        assert!(ctx.ids.next_id() > 0);
    }

    #[test]
    fn bad_node_is_refused() {
        let config = AppConfig {
            snowflake_node: -1,
            ..AppConfig::default()
        };
        assert!(matches!(
            AppContext::build(config, Backends::in_memory()),
            Err(ConfigError::NodeOutOfRange { .. })
        ));
    }
}
