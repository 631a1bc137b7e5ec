//! "Hot" and "new" item rankings kept in the fast store.
//!
//! The hot ranking moves only when an order is paid. Both rankings and the
//! per-item stock mirror can be recomputed from durable items at any time with
//! [`RankingMaintainer::rebuild`], which is also the reconciliation path for
//! score updates that failed after a payment.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use flashsale_core::ItemId;
use flashsale_sales::OrderLine;

use crate::fast_store::{BatchOp, FastStore, FastStoreError};
use crate::keys;
use crate::repository::{ItemRepository, StoreError};

#[derive(Debug, Error)]
pub enum RankingError {
    #[error(transparent)]
    Store(#[from] FastStoreError),

    #[error("could not load items: {0}")]
    Durable(#[from] StoreError),
}

/// What a rebuild wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RebuildSummary {
    /// Stock mirrors written (every durable item).
    pub items: usize,
    /// Items placed in the rankings (active items only).
    pub ranked: usize,
}

#[derive(Clone)]
pub struct RankingMaintainer {
    store: Arc<dyn FastStore>,
    items: Arc<dyn ItemRepository>,
}

impl std::fmt::Debug for RankingMaintainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankingMaintainer").finish_non_exhaustive()
    }
}

impl RankingMaintainer {
    pub fn new(store: Arc<dyn FastStore>, items: Arc<dyn ItemRepository>) -> Self {
        Self { store, items }
    }

    /// Add `quantity` to the item's hot score. Call only for paid orders.
    #[instrument(skip_all, fields(item_id = %item_id), err)]
    pub async fn record_sale(&self, item_id: ItemId, quantity: i64) -> Result<f64, RankingError> {
        Ok(self
            .store
            .zincr_by(keys::HOT_RANKING, &item_id.to_string(), quantity as f64)
            .await?)
    }

    /// Record every line of a paid order. Failures are logged, never returned.
    pub async fn record_sales(&self, lines: &[OrderLine]) {
        for line in lines {
            if let Err(err) = self.record_sale(line.item_id, line.quantity).await {
                warn!(
                    item_id = %line.item_id,
                    quantity = line.quantity,
                    error = %err,
                    "hot ranking update failed; left for rebuild"
                );
            }
        }
    }

    /// Recompute both rankings and every stock mirror from durable items in
    /// one batched round trip.
    ///
    /// Withdrawn items get a zero stock mirror and are left out of the rankings.
    #[instrument(skip(self), err)]
    pub async fn rebuild(&self) -> Result<RebuildSummary, RankingError> {
        let items = self.items.list_items().await?;

        let mut ops = Vec::with_capacity(2 + items.len() * 3);
        ops.push(BatchOp::Delete {
            key: keys::HOT_RANKING.to_string(),
        });
        ops.push(BatchOp::Delete {
            key: keys::NEW_RANKING.to_string(),
        });

        let mut summary = RebuildSummary::default();
        for item in &items {
            let stock = if item.is_active() { item.stock } else { 0 };
            ops.push(BatchOp::Set {
                key: keys::stock(item.id),
                value: stock.to_string(),
            });
            summary.items += 1;

            if item.is_active() {
                let member = item.id.to_string();
                ops.push(BatchOp::ZAdd {
                    key: keys::HOT_RANKING.to_string(),
                    member: member.clone(),
                    score: item.hot_score(),
                });
                ops.push(BatchOp::ZAdd {
                    key: keys::NEW_RANKING.to_string(),
                    member,
                    score: item.new_score(),
                });
                summary.ranked += 1;
            }
        }

        self.store.apply_batch(&ops).await?;
        info!(items = summary.items, ranked = summary.ranked, "rankings and stock mirror rebuilt");
        Ok(summary)
    }

    pub async fn top_hot(&self, limit: usize) -> Result<Vec<(ItemId, f64)>, RankingError> {
        self.top(keys::HOT_RANKING, limit).await
    }

    pub async fn top_new(&self, limit: usize) -> Result<Vec<(ItemId, f64)>, RankingError> {
        self.top(keys::NEW_RANKING, limit).await
    }

    async fn top(&self, key: &str, limit: usize) -> Result<Vec<(ItemId, f64)>, RankingError> {
        let members = self.store.zrevrange_with_scores(key, limit).await?;
        Ok(members
            .into_iter()
            .filter_map(|(member, score)| match member.parse::<i64>() {
                Ok(id) => Some((ItemId::new(id), score)),
                Err(_) => {
                    warn!(key, member = %member, "skipping non-numeric ranking member");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_store::InMemoryFastStore;
    use crate::repository::InMemoryStore;
    use chrono::{TimeZone, Utc};
    use flashsale_core::{OrderId, OrderLineId};
    use flashsale_inventory::Item;

    fn item(id: i64, stock: i64, sale: i64, created_secs: i64) -> Item {
        let mut item = Item::new(
            ItemId::new(id),
            format!("item {id}"),
            100,
            stock,
            Utc.timestamp_opt(created_secs, 0).unwrap(),
        )
        .unwrap();
        item.sale = sale;
        item
    }

    fn maintainer(items: &[Item]) -> (RankingMaintainer, Arc<InMemoryFastStore>) {
        let durable = Arc::new(InMemoryStore::new());
        for i in items {
            durable.put_item(i.clone());
        }
        let fast = Arc::new(InMemoryFastStore::new());
        (RankingMaintainer::new(fast.clone(), durable), fast)
    }

    #[tokio::test]
    async fn rebuild_reproduces_durable_scores_in_one_batch() {
        let (ranking, fast) = maintainer(&[
            item(1, 10, 3, 1_000),
            item(2, 0, 7, 3_000),
            item(3, 5, 0, 2_000),
        ]);
        let summary = ranking.rebuild().await.unwrap();
        assert_eq!(summary, RebuildSummary { items: 3, ranked: 3 });
        assert_eq!(fast.batch_count(), 1);

        assert_eq!(fast.counter("stock:1"), Some(10));
        assert_eq!(fast.counter("stock:2"), Some(0));
        let hot = ranking.top_hot(10).await.unwrap();
        assert_eq!(
            hot,
            vec![(ItemId::new(2), 7.0), (ItemId::new(1), 3.0), (ItemId::new(3), 0.0)]
        );
        let new = ranking.top_new(2).await.unwrap();
        assert_eq!(new, vec![(ItemId::new(2), 3_000.0), (ItemId::new(3), 2_000.0)]);
    }

    #[tokio::test]
    async fn rebuild_drops_stale_members_and_zeroes_withdrawn_stock() {
        let mut withdrawn = item(2, 9, 4, 2_000);
        withdrawn.withdraw();
        let (ranking, fast) = maintainer(&[item(1, 1, 0, 1_000), withdrawn]);
        fast.zincr_by(keys::HOT_RANKING, "99", 50.0).await.unwrap();

        let summary = ranking.rebuild().await.unwrap();
        assert_eq!(summary, RebuildSummary { items: 2, ranked: 1 });
        assert_eq!(fast.counter("stock:2"), Some(0));
        assert_eq!(fast.score(keys::HOT_RANKING, "99"), None);
        assert_eq!(fast.score(keys::HOT_RANKING, "2"), None);
    }

    #[tokio::test]
    async fn record_sales_bumps_each_line() {
        let (ranking, fast) = maintainer(&[]);
        let lines: Vec<OrderLine> = [(1, 1), (2, 1), (1, 2)]
            .iter()
            .enumerate()
            .map(|(n, (item, qty))| OrderLine {
                id: OrderLineId::new(n as i64),
                order_id: OrderId::new(1),
                item_id: ItemId::new(*item),
                quantity: *qty,
                unit_price: 10,
                subtotal: 10 * qty,
            })
            .collect();
        ranking.record_sales(&lines).await;
        assert_eq!(fast.score(keys::HOT_RANKING, "1"), Some(3.0));
        assert_eq!(fast.score(keys::HOT_RANKING, "2"), Some(1.0));
    }

    #[tokio::test]
    async fn record_sales_swallows_store_failures() {
        let (ranking, fast) = maintainer(&[]);
        fast.set_unavailable(true);
        let line = OrderLine {
            id: OrderLineId::new(1),
            order_id: OrderId::new(1),
            item_id: ItemId::new(1),
            quantity: 1,
            unit_price: 10,
            subtotal: 10,
        };
        ranking.record_sales(&[line]).await;
        assert!(ranking.record_sale(ItemId::new(1), 1).await.is_err());
    }
}
