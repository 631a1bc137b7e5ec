use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flashsale_core::{DomainError, DomainResult, ItemId};

/// Sale status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Active,
    Withdrawn,
}

impl ItemStatus {
    /// Persisted as a small integer (1 = on sale, 0 = withdrawn).
    pub fn as_code(self) -> i16 {
        match self {
            ItemStatus::Active => 1,
            ItemStatus::Withdrawn => 0,
        }
    }

    pub fn from_code(code: i16) -> Self {
        if code == 1 {
            ItemStatus::Active
        } else {
            ItemStatus::Withdrawn
        }
    }
}

/// A purchasable item as held in durable storage.
///
/// `stock` is authoritative and never negative. `sale` is the cumulative quantity
/// sold through paid orders; together with `created_at` it is the source the
/// rankings are rebuilt from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    /// Price in smallest currency unit (e.g., cents).
    pub price: i64,
    pub stock: i64,
    pub sale: i64,
    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Create a new active item with no sales.
    pub fn new(
        id: ItemId,
        title: impl Into<String>,
        price: i64,
        stock: i64,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(DomainError::validation("title must not be empty"));
        }
        if price < 0 {
            return Err(DomainError::validation("price must not be negative"));
        }
        if stock < 0 {
            return Err(DomainError::validation("stock must not be negative"));
        }

        Ok(Self {
            id,
            title,
            price,
            stock,
            sale: 0,
            status: ItemStatus::Active,
            created_at,
        })
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, ItemStatus::Active)
    }

    pub fn withdraw(&mut self) {
        self.status = ItemStatus::Withdrawn;
    }

    /// Check that `quantity` units can be sold right now.
    pub fn ensure_purchasable(&self, quantity: i64) -> DomainResult<()> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if !self.is_active() {
            return Err(DomainError::withdrawn(format!("item {}", self.id)));
        }
        if self.stock < quantity {
            return Err(DomainError::out_of_stock(format!(
                "item {} has {} left, {} requested",
                self.id, self.stock, quantity
            )));
        }
        Ok(())
    }

    /// Take `quantity` units out of stock.
    pub fn take_stock(&mut self, quantity: i64) -> DomainResult<()> {
        self.ensure_purchasable(quantity)?;
        self.stock -= quantity;
        Ok(())
    }

    /// Put units back (cancellation).
    pub fn restore_stock(&mut self, quantity: i64) -> DomainResult<()> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        self.stock = self
            .stock
            .checked_add(quantity)
            .ok_or_else(|| DomainError::invariant("stock overflow"))?;
        Ok(())
    }

    /// Count `quantity` units as sold (payment).
    pub fn record_sale(&mut self, quantity: i64) {
        self.sale = self.sale.saturating_add(quantity);
    }

    /// Score in the "hot" ranking: cumulative quantity sold.
    pub fn hot_score(&self) -> f64 {
        self.sale as f64
    }

    /// Score in the "new" ranking: creation time in epoch seconds.
    pub fn new_score(&self) -> f64 {
        self.created_at.timestamp() as f64
    }
}
