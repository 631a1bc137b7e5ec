//! Process startup and shutdown.
//!
//! Startup order matters: the stock mirror must be rebuilt before the first
//! reservation, and the topology must exist before anything is published.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use flashsale_core::ConfigError;
use flashsale_events::{QueueError, Topology, routing};
use flashsale_infra::config::AppConfig;
use flashsale_infra::context::{AppContext, Backends};
use flashsale_infra::notifications::NotificationLogger;
use flashsale_infra::ranking::RankingError;
use flashsale_infra::workers::{DeliveryHandler, IntakeWorker, WorkerHandle};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not declare queue topology: {0}")]
    Topology(#[from] QueueError),

    #[error("could not rebuild stock mirror and rankings: {0}")]
    Rebuild(#[from] RankingError),
}

/// A running process: its services and the consumers working for it.
#[derive(Debug)]
pub struct App {
    ctx: AppContext,
    workers: Vec<WorkerHandle>,
}

impl App {
    /// Build every service, declare the topology, rebuild the fast store from
    /// durable items, then start the consumers.
    pub async fn start(config: AppConfig, backends: Backends) -> Result<Self, StartupError> {
        let ctx = AppContext::build(config, backends)?;
        info!(node = ctx.ids.node(), "id generator ready");

        let topology = Topology::standard(ctx.config.intake_max_deliveries);
        ctx.backends.queue.declare(&topology).await?;

        let summary = ctx.ranking.rebuild().await?;
        info!(items = summary.items, ranked = summary.ranked, "fast store warmed up");

        let workers = spawn_workers(&ctx);
        info!(workers = workers.len(), "flash-sale core started");
        Ok(Self { ctx, workers })
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn worker_names(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|w| w.name())
    }

    /// Stop every consumer, letting in-flight messages settle first.
    pub async fn shutdown(self) {
        info!(workers = self.workers.len(), "stopping consumers");
        for worker in self.workers {
            worker.shutdown().await;
        }
        info!("flash-sale core stopped");
    }
}

fn spawn_workers(ctx: &AppContext) -> Vec<WorkerHandle> {
    let node = ctx.ids.node();
    let queue = &ctx.backends.queue;
    let poll = ctx.config.intake_poll;

    let persister: Arc<dyn DeliveryHandler> = Arc::new(ctx.persister.clone());
    let notifications: Arc<dyn DeliveryHandler> = Arc::new(NotificationLogger);

    let mut workers: Vec<WorkerHandle> = (0..ctx.config.intake_workers)
        .map(|i| {
            IntakeWorker::spawn(
                format!("{}-{node}-{i}", routing::FLASH_SALE_QUEUE),
                queue.clone(),
                routing::FLASH_SALE_QUEUE,
                persister.clone(),
                poll,
            )
        })
        .collect();

    for queue_name in [routing::ORDER_CREATED_QUEUE, routing::USER_REGISTERED_QUEUE] {
        workers.push(IntakeWorker::spawn(
            format!("{queue_name}-{node}-0"),
            queue.clone(),
            queue_name,
            notifications.clone(),
            poll,
        ));
    }
    workers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use flashsale_core::{ItemId, UserId};
    use flashsale_events::{InMemoryIntakeQueue, IntentLine};
    use flashsale_infra::checkout::OrderRequest;
    use flashsale_infra::fast_store::InMemoryFastStore;
    use flashsale_infra::notifications;
    use flashsale_infra::repository::InMemoryStore;
    use flashsale_inventory::Item;

    fn config() -> AppConfig {
        AppConfig {
            intake_workers: 2,
            intake_poll: Duration::from_millis(20),
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn start_warms_up_and_processes_orders_until_shutdown() {
        let fast = Arc::new(InMemoryFastStore::new());
        let durable = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryIntakeQueue::new());
        durable.put_item(Item::new(ItemId::new(1), "kettle", 2_500, 3, Utc::now()).unwrap());

        let backends = Backends {
            fast: fast.clone(),
            items: durable.clone(),
            orders: durable.clone(),
            queue: queue.clone(),
        };
        let app = App::start(config(), backends).await.unwrap();
        assert_eq!(fast.counter("stock:1"), Some(3));

        let names: Vec<&str> = app.worker_names().collect();
        assert_eq!(
            names,
            vec![
                "order_seckill_queue-1-0",
                "order_seckill_queue-1-1",
                "order_created_queue-1-0",
                "user_registered_queue-1-0",
            ]
        );

        let request = OrderRequest {
            user_id: UserId::new(7),
            items: vec![IntentLine {
                item_id: ItemId::new(1),
                quantity: 1,
                price: 2_500,
            }],
        };
        app.context().checkout.place_flash_order(&request).await.unwrap();
        notifications::announce_user_registered(queue.as_ref(), UserId::new(7))
            .await
            .unwrap();

        for _ in 0..200 {
            if durable.order_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(durable.order_count(), 1);

        app.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_id_settings_stop_startup() {
        let config = AppConfig {
            snowflake_epoch: "2999-01-01".to_string(),
            ..config()
        };
        assert!(matches!(
            App::start(config, Backends::in_memory()).await,
            Err(StartupError::Config(_))
        ));
    }

    #[tokio::test]
    async fn unreadable_durable_items_stop_startup() {
        let durable = Arc::new(InMemoryStore::new());
        durable.set_unavailable(true);
        let backends = Backends {
            items: durable.clone(),
            orders: durable,
            ..Backends::in_memory()
        };
        assert!(matches!(
            App::start(config(), backends).await,
            Err(StartupError::Rebuild(_))
        ));
    }
}
