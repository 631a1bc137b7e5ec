//! Durable storage boundary for items and orders.
//!
//! Orders and their lines are written as one unit together with the stock they
//! take, so a committed order never exists without its lines or its stock
//! deduction. Order numbers are unique: inserting an order whose number already
//! exists is reported, not duplicated.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use flashsale_core::{DomainError, ItemId, OrderId, OrderNo, UserId};
use flashsale_inventory::Item;
use flashsale_sales::Order;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the operation may succeed if retried.
    #[error("durable store unavailable: {0}")]
    Unavailable(String),

    /// The write was refused by a business rule (missing/withdrawn item,
    /// insufficient stock, illegal status transition, ...).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Stored rows cannot be turned back into valid domain values.
    #[error("stored data is inconsistent: {0}")]
    Corrupt(String),

    #[error("durable store query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result of inserting an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(OrderId),
    /// An order with the same number already exists; nothing was written.
    Duplicate(OrderId),
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPage {
    /// Newest first.
    pub orders: Vec<Order>,
    pub total: u64,
}

#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn find_item(&self, id: ItemId) -> Result<Option<Item>, StoreError>;

    /// Every item, active or withdrawn.
    async fn list_items(&self) -> Result<Vec<Item>, StoreError>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Write the order and its lines and take each line's quantity out of the
    /// item's durable stock, all or nothing. A missing or withdrawn item, or
    /// insufficient stock, fails with [`StoreError::Domain`].
    async fn insert_order(&self, order: &Order) -> Result<InsertOutcome, StoreError>;

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    async fn find_by_order_no(&self, order_no: &OrderNo) -> Result<Option<Order>, StoreError>;

    async fn list_for_user(&self, user_id: UserId, page: Page) -> Result<OrderPage, StoreError>;

    /// Pending → paid, adding each line's quantity to its item's sale count in
    /// the same transaction.
    async fn mark_paid(&self, id: OrderId, at: DateTime<Utc>) -> Result<Order, StoreError>;

    /// Pending → cancelled, putting each line's quantity back into its item's
    /// durable stock in the same transaction.
    async fn mark_cancelled(&self, id: OrderId) -> Result<Order, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_is_clamped() {
        assert_eq!(Page::new(0, 0), Page { page: 1, page_size: 1 });
        assert_eq!(Page::new(3, 1_000).page_size, Page::MAX_PAGE_SIZE);
        assert_eq!(Page::new(3, 20).offset(), 40);
    }

    #[test]
    fn only_unavailability_is_transient() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::Domain(DomainError::NotFound).is_transient());
        assert!(!StoreError::Query("syntax".into()).is_transient());
    }
}
