//! Payloads carried on the intake queue.

use serde::{Deserialize, Serialize};

use flashsale_core::{ItemId, OrderNo, UserId};

/// One requested line of an order intent. `price` is the unit price the buyer
/// saw; the persister recomputes subtotals from it and never trusts a total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentLine {
    pub item_id: ItemId,
    pub quantity: i64,
    pub price: i64,
}

/// An admitted flash-sale purchase waiting to be written durably.
///
/// Published on `order.seckill` after the inventory gate accepted the
/// reservation. Never stored as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub user_id: UserId,
    pub items: Vec<IntentLine>,
    pub order_no: OrderNo,
    /// Epoch seconds.
    pub create_time: i64,
}

/// `order.created` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_no: OrderNo,
}

/// `user.registered` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: UserId,
}
