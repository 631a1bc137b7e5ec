//! Order persister: turns admitted order intents into durable orders.
//!
//! Each delivery ends in exactly one of four dispositions:
//!
//! | Outcome | Example | Settlement |
//! |---------|---------|------------|
//! | committed | order written, or the order number was already stored | ack |
//! | discarded | undecodable payload, empty line list, withdrawn item, no durable stock | ack |
//! | requeue | durable store unreachable | nack with requeue |
//! | reject | query refused by the store, unreadable stored rows | nack without requeue |
//!
//! Requeued messages come back from the broker; once a message exceeds the
//! queue's delivery limit the broker dead-letters it. There is no local retry
//! loop. Redelivery of an order that was in fact committed is absorbed by the
//! unique order number and reported as [`Persisted::AlreadyExists`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use flashsale_core::{DomainError, IdGenerator, OrderId, OrderLineId};
use flashsale_events::{Delivery, OrderIntent};
use flashsale_sales::{LineDraft, Order};

use crate::repository::{InsertOutcome, OrderRepository, StoreError};
use crate::workers::{DeliveryHandler, Settle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    Created(OrderId),
    AlreadyExists(OrderId),
}

impl Persisted {
    pub fn order_id(&self) -> OrderId {
        match self {
            Persisted::Created(id) | Persisted::AlreadyExists(id) => *id,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    /// The message can never be processed, however often it is retried.
    #[error("malformed order intent: {0}")]
    Malformed(String),

    /// A business rule refused the order.
    #[error("order refused: {0}")]
    Business(DomainError),

    /// Not committed yet; a later attempt may succeed.
    #[error("order not committed: {0}")]
    Transient(StoreError),

    /// The store failed in a way a retry will not change.
    #[error("order cannot be stored: {0}")]
    Permanent(StoreError),
}

impl PersistError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistError::Transient(_))
    }
}

#[derive(Debug)]
pub enum Disposition {
    Committed(Persisted),
    Discarded(PersistError),
    Requeue(PersistError),
    Reject(PersistError),
}

impl Disposition {
    pub fn settle(&self) -> Settle {
        match self {
            Disposition::Committed(_) | Disposition::Discarded(_) => Settle::Ack,
            Disposition::Requeue(_) => Settle::Requeue,
            Disposition::Reject(_) => Settle::Reject,
        }
    }
}

#[derive(Clone)]
pub struct OrderPersister {
    orders: Arc<dyn OrderRepository>,
    ids: Arc<IdGenerator>,
}

impl std::fmt::Debug for OrderPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderPersister")
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

impl OrderPersister {
    pub fn new(orders: Arc<dyn OrderRepository>, ids: Arc<IdGenerator>) -> Self {
        Self { orders, ids }
    }

    /// Decode and persist one delivery, deciding how it must be settled.
    #[instrument(
        skip(self, delivery),
        fields(tag = %delivery.tag, delivery_count = delivery.delivery_count)
    )]
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        let intent = match serde_json::from_slice::<OrderIntent>(&delivery.body) {
            Ok(intent) => intent,
            Err(err) => {
                let err = PersistError::Malformed(err.to_string());
                warn!(error = %err, "discarding undecodable intake message");
                return Disposition::Discarded(err);
            }
        };

        match self.persist(&intent).await {
            Ok(persisted) => Disposition::Committed(persisted),
            Err(err) if err.is_retryable() => {
                warn!(order_no = %intent.order_no, error = %err, "order not committed; requeueing");
                Disposition::Requeue(err)
            }
            Err(err @ PersistError::Permanent(_)) => {
                error!(order_no = %intent.order_no, error = %err, "order not storable; dead-lettering");
                Disposition::Reject(err)
            }
            Err(err) => {
                warn!(order_no = %intent.order_no, error = %err, "discarding order intent");
                Disposition::Discarded(err)
            }
        }
    }

    /// Write the intent as a pending order. Totals are recomputed from the
    /// lines; the order number is the idempotency key.
    #[instrument(skip(self, intent), fields(order_no = %intent.order_no, user_id = %intent.user_id), err)]
    pub async fn persist(&self, intent: &OrderIntent) -> Result<Persisted, PersistError> {
        let created_at = Utc
            .timestamp_opt(intent.create_time, 0)
            .single()
            .ok_or_else(|| {
                PersistError::Malformed(format!("create_time {} out of range", intent.create_time))
            })?;

        let drafts: Vec<LineDraft> = intent
            .items
            .iter()
            .map(|line| LineDraft {
                item_id: line.item_id,
                quantity: line.quantity,
                unit_price: line.price,
            })
            .collect();

        let order = Order::create(
            OrderId::new(self.ids.next_id()),
            intent.user_id,
            intent.order_no.clone(),
            &drafts,
            || OrderLineId::new(self.ids.next_id()),
            created_at,
        )
        .map_err(|err| match err {
            DomainError::Validation(_) | DomainError::InvariantViolation(_) => {
                PersistError::Malformed(err.to_string())
            }
            other => PersistError::Business(other),
        })?;

        match self.orders.insert_order(&order).await {
            Ok(InsertOutcome::Created(id)) => {
                info!(order_id = %id, total_amount = order.total_amount(), "order persisted");
                Ok(Persisted::Created(id))
            }
            Ok(InsertOutcome::Duplicate(id)) => {
                info!(order_id = %id, "order number already persisted");
                Ok(Persisted::AlreadyExists(id))
            }
            Err(StoreError::Domain(err)) => Err(PersistError::Business(err)),
            Err(err) if err.is_transient() => Err(PersistError::Transient(err)),
            Err(err) => Err(PersistError::Permanent(err)),
        }
    }
}

#[async_trait]
impl DeliveryHandler for OrderPersister {
    async fn on_delivery(&self, delivery: &Delivery) -> Settle {
        self.handle(delivery).await.settle()
    }
}
