//! Order entry points used by the request-handling layer.
//!
//! Two ways in:
//! - `place_flash_order`: admission through the inventory gate, then an order
//!   intent on the queue; the durable order is written later by the persister
//! - `create_order`: a synchronous write using durable item prices
//!
//! Payment and cancellation move durable state first and only then touch the
//! fast store (rankings, stock mirror); fast-store failures there are logged
//! and never undo the durable change.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use flashsale_core::{DomainError, IdGenerator, ItemId, OrderId, OrderLineId, OrderNo, UserId};
use flashsale_events::{IntakeQueue, IntentLine, OrderIntent, QueueError, publish_json, routing};
use flashsale_sales::{LineDraft, Order};

use crate::gate::{GateError, InventoryGate, Reservation};
use crate::notifications;
use crate::ranking::RankingMaintainer;
use crate::repository::{InsertOutcome, ItemRepository, OrderPage, OrderRepository, Page, StoreError};

/// A buyer's request: lines of (item, quantity, unit price seen).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub user_id: UserId,
    pub items: Vec<IntentLine>,
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    /// Refused by a business rule: out of stock, withdrawn, not the owner, ...
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The admission gate could not decide; the request is refused.
    #[error("admission unavailable: {0}")]
    Gate(#[from] GateError),

    /// The intake queue did not take the order; nothing was reserved.
    #[error("system busy, try again: {0}")]
    Busy(#[from] QueueError),

    #[error("durable store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CheckoutError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(err) => CheckoutError::Domain(err),
            other => CheckoutError::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    ids: Arc<IdGenerator>,
    gate: InventoryGate,
    queue: Arc<dyn IntakeQueue>,
    items: Arc<dyn ItemRepository>,
    orders: Arc<dyn OrderRepository>,
    ranking: RankingMaintainer,
}

impl std::fmt::Debug for CheckoutService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutService").finish_non_exhaustive()
    }
}

impl CheckoutService {
    pub fn new(
        ids: Arc<IdGenerator>,
        gate: InventoryGate,
        queue: Arc<dyn IntakeQueue>,
        items: Arc<dyn ItemRepository>,
        orders: Arc<dyn OrderRepository>,
        ranking: RankingMaintainer,
    ) -> Self {
        Self {
            ids,
            gate,
            queue,
            items,
            orders,
            ranking,
        }
    }

    /// Flash-sale purchase of a single item. Returns the order number the
    /// order will be stored under once the persister has written it.
    ///
    /// Only the first line is admitted; a flash sale sells one item per order.
    #[instrument(skip(self, request), fields(user_id = %request.user_id), err)]
    pub async fn place_flash_order(&self, request: &OrderRequest) -> Result<OrderNo, CheckoutError> {
        let line = *request
            .items
            .first()
            .ok_or_else(|| DomainError::validation("order must have at least one line"))?;
        if line.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive").into());
        }

        if let Reservation::Rejected(out) = self.gate.reserve(line.item_id, line.quantity).await? {
            return Err(DomainError::out_of_stock(format!(
                "item {} cannot supply {}",
                out.item_id, out.requested
            ))
            .into());
        }

        let intent = OrderIntent {
            user_id: request.user_id,
            items: vec![line],
            order_no: OrderNo::from_id(self.ids.next_id()),
            create_time: Utc::now().timestamp(),
        };

        if let Err(err) = publish_json(self.queue.as_ref(), routing::FLASH_SALE_ORDER, &intent).await {
            warn!(order_no = %intent.order_no, error = %err, "order intent not published; releasing reservation");
            if let Err(release_err) = self.gate.release(line.item_id, line.quantity).await {
                warn!(item_id = %line.item_id, error = %release_err, "release after failed publish failed");
            }
            return Err(CheckoutError::Busy(err));
        }

        info!(order_no = %intent.order_no, item_id = %line.item_id, "flash order admitted");
        Ok(intent.order_no)
    }

    /// Synchronous order creation at durable prices.
    #[instrument(skip(self, request), fields(user_id = %request.user_id), err)]
    pub async fn create_order(&self, request: &OrderRequest) -> Result<Order, CheckoutError> {
        if request.items.is_empty() {
            return Err(DomainError::validation("order must have at least one line").into());
        }

        let mut drafts = Vec::with_capacity(request.items.len());
        for line in &request.items {
            let item = self
                .items
                .find_item(line.item_id)
                .await?
                .ok_or(DomainError::NotFound)?;
            item.ensure_purchasable(line.quantity)?;
            drafts.push(LineDraft {
                item_id: item.id,
                quantity: line.quantity,
                unit_price: item.price,
            });
        }

        let order_id = OrderId::new(self.ids.next_id());
        let order = Order::create(
            order_id,
            request.user_id,
            OrderNo::from_id(order_id.get()),
            &drafts,
            || OrderLineId::new(self.ids.next_id()),
            Utc::now(),
        )?;

        let reserved = self.reserve_all(&drafts).await?;
        match self.orders.insert_order(&order).await {
            Ok(InsertOutcome::Created(_)) | Ok(InsertOutcome::Duplicate(_)) => {}
            Err(err) => {
                self.release_all(&reserved).await;
                return Err(err.into());
            }
        }

        info!(order_no = %order.order_no(), total_amount = order.total_amount(), "order created");
        let queue = self.queue.clone();
        let order_no = order.order_no().clone();
        tokio::spawn(async move {
            if let Err(err) = notifications::announce_order_created(queue.as_ref(), &order_no).await {
                warn!(order_no = %order_no, error = %err, "order.created notification not published");
            }
        });
        Ok(order)
    }

    /// Pending → paid. Ranking updates run detached after the commit.
    #[instrument(skip_all, fields(user_id = %user_id, order_id = %order_id), err)]
    pub async fn pay_order(&self, user_id: UserId, order_id: OrderId) -> Result<Order, CheckoutError> {
        self.get_order(user_id, order_id).await?;
        let paid = self.orders.mark_paid(order_id, Utc::now()).await?;

        let ranking = self.ranking.clone();
        let lines = paid.lines().to_vec();
        tokio::spawn(async move { ranking.record_sales(&lines).await });

        info!(order_no = %paid.order_no(), "order paid");
        Ok(paid)
    }

    /// Pending → cancelled, returning the stock to the admission gate.
    #[instrument(skip_all, fields(user_id = %user_id, order_id = %order_id), err)]
    pub async fn cancel_order(&self, user_id: UserId, order_id: OrderId) -> Result<Order, CheckoutError> {
        self.get_order(user_id, order_id).await?;
        let cancelled = self.orders.mark_cancelled(order_id).await?;

        for line in cancelled.lines() {
            if let Err(err) = self.gate.release(line.item_id, line.quantity).await {
                warn!(item_id = %line.item_id, quantity = line.quantity, error = %err, "stock mirror not released; left for rebuild");
            }
        }
        info!(order_no = %cancelled.order_no(), "order cancelled");
        Ok(cancelled)
    }

    pub async fn get_order(&self, user_id: UserId, order_id: OrderId) -> Result<Order, CheckoutError> {
        let order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        order.ensure_owned_by(user_id)?;
        Ok(order)
    }

    pub async fn list_orders(&self, user_id: UserId, page: Page) -> Result<OrderPage, CheckoutError> {
        Ok(self.orders.list_for_user(user_id, page).await?)
    }

    /// Reserve every line, undoing earlier reservations if a later one fails.
    async fn reserve_all(&self, drafts: &[LineDraft]) -> Result<Vec<(ItemId, i64)>, CheckoutError> {
        let mut reserved = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let outcome = match self.gate.reserve(draft.item_id, draft.quantity).await {
                Ok(Reservation::Accepted { .. }) => {
                    reserved.push((draft.item_id, draft.quantity));
                    continue;
                }
                Ok(Reservation::Rejected(out)) => CheckoutError::Domain(DomainError::out_of_stock(
                    format!("item {} cannot supply {}", out.item_id, out.requested),
                )),
                Err(err) => CheckoutError::Gate(err),
            };
            self.release_all(&reserved).await;
            return Err(outcome);
        }
        Ok(reserved)
    }

    async fn release_all(&self, reserved: &[(ItemId, i64)]) {
        for (item_id, quantity) in reserved {
            if let Err(err) = self.gate.release(*item_id, *quantity).await {
                warn!(item_id = %item_id, quantity, error = %err, "reservation not released; left for rebuild");
            }
        }
    }
}
