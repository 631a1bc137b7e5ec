use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flashsale_core::{DomainError, DomainResult, ItemId, OrderId, OrderLineId, OrderNo, UserId};

/// Order status lifecycle: `Pending → Paid` or `Pending → Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
}

impl OrderStatus {
    pub fn as_code(self) -> i16 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Paid => 1,
            OrderStatus::Cancelled => 2,
        }
    }

    pub fn from_code(code: i16) -> DomainResult<Self> {
        match code {
            0 => Ok(OrderStatus::Pending),
            1 => Ok(OrderStatus::Paid),
            2 => Ok(OrderStatus::Cancelled),
            other => Err(DomainError::invariant(format!("unknown order status {other}"))),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

/// A requested line before it belongs to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDraft {
    pub item_id: ItemId,
    pub quantity: i64,
    /// Price in smallest currency unit (e.g., cents).
    pub unit_price: i64,
}

/// Order line: item, quantity, unit price and the derived subtotal. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: OrderLineId,
    pub order_id: OrderId,
    pub item_id: ItemId,
    pub quantity: i64,
    pub unit_price: i64,
    pub subtotal: i64,
}

impl OrderLine {
    pub fn new(id: OrderLineId, order_id: OrderId, draft: LineDraft) -> DomainResult<Self> {
        if draft.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if draft.unit_price < 0 {
            return Err(DomainError::validation("unit_price must not be negative"));
        }
        let subtotal = draft
            .quantity
            .checked_mul(draft.unit_price)
            .ok_or_else(|| DomainError::validation("line subtotal overflows"))?;

        Ok(Self {
            id,
            order_id,
            item_id: draft.item_id,
            quantity: draft.quantity,
            unit_price: draft.unit_price,
            subtotal,
        })
    }
}

/// A durable order.
///
/// The total is always derived from the lines; callers never supply it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    order_no: OrderNo,
    total_amount: i64,
    status: OrderStatus,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    lines: Vec<OrderLine>,
}

impl Order {
    /// Build a new pending order, computing subtotals and the total.
    pub fn create(
        id: OrderId,
        user_id: UserId,
        order_no: OrderNo,
        drafts: &[LineDraft],
        mut next_line_id: impl FnMut() -> OrderLineId,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if drafts.is_empty() {
            return Err(DomainError::validation("order must have at least one line"));
        }

        let lines = drafts
            .iter()
            .map(|d| OrderLine::new(next_line_id(), id, *d))
            .collect::<DomainResult<Vec<_>>>()?;
        let total_amount = total_of(&lines)?;

        Ok(Self {
            id,
            user_id,
            order_no,
            total_amount,
            status: OrderStatus::Pending,
            paid_at: None,
            created_at,
            lines,
        })
    }

    /// Reassemble an order loaded from storage, re-checking its arithmetic.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: OrderId,
        user_id: UserId,
        order_no: OrderNo,
        total_amount: i64,
        status: OrderStatus,
        paid_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        lines: Vec<OrderLine>,
    ) -> DomainResult<Self> {
        for line in &lines {
            if line.order_id != id {
                return Err(DomainError::invariant(format!(
                    "line {} belongs to order {}",
                    line.id, line.order_id
                )));
            }
            if line.quantity.checked_mul(line.unit_price) != Some(line.subtotal) {
                return Err(DomainError::invariant(format!(
                    "line {} subtotal does not equal quantity x unit_price",
                    line.id
                )));
            }
        }
        if total_of(&lines)? != total_amount {
            return Err(DomainError::invariant(format!(
                "order {order_no} total does not equal the sum of its lines"
            )));
        }

        Ok(Self {
            id,
            user_id,
            order_no,
            total_amount,
            status,
            paid_at,
            created_at,
            lines,
        })
    }

    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn order_no(&self) -> &OrderNo {
        &self.order_no
    }

    pub fn total_amount(&self) -> i64 {
        self.total_amount
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn is_paid(&self) -> bool {
        matches!(self.status, OrderStatus::Paid)
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn ensure_owned_by(&self, user_id: UserId) -> DomainResult<()> {
        if self.user_id != user_id {
            return Err(DomainError::Forbidden);
        }
        Ok(())
    }

    /// Pending → Paid.
    pub fn pay(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            OrderStatus::Pending => {
                self.status = OrderStatus::Paid;
                self.paid_at = Some(at);
                Ok(())
            }
            OrderStatus::Paid => Err(DomainError::conflict(format!(
                "order {} already paid",
                self.order_no
            ))),
            OrderStatus::Cancelled => Err(DomainError::invariant(format!(
                "order {} is cancelled and cannot be paid",
                self.order_no
            ))),
        }
    }

    /// Pending → Cancelled.
    pub fn cancel(&mut self) -> DomainResult<()> {
        if self.status != OrderStatus::Pending {
            return Err(DomainError::invariant(format!(
                "only pending orders can be cancelled (order {} is {:?})",
                self.order_no, self.status
            )));
        }
        self.status = OrderStatus::Cancelled;
        Ok(())
    }
}

fn total_of(lines: &[OrderLine]) -> DomainResult<i64> {
    lines.iter().try_fold(0i64, |acc, l| {
        acc.checked_add(l.subtotal)
            .ok_or_else(|| DomainError::validation("order total overflows"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn line_ids() -> impl FnMut() -> OrderLineId {
        let mut n = 100;
        move || {
            n += 1;
            OrderLineId::new(n)
        }
    }

    fn draft(item: i64, quantity: i64, unit_price: i64) -> LineDraft {
        LineDraft {
            item_id: ItemId::new(item),
            quantity,
            unit_price,
        }
    }

    fn pending_order() -> Order {
        Order::create(
            OrderId::new(1),
            UserId::new(7),
            OrderNo::from_id(1),
            &[draft(1, 2, 300), draft(2, 1, 150)],
            line_ids(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn create_computes_subtotals_and_total() {
        let order = pending_order();
        assert_eq!(order.lines()[0].subtotal, 600);
        assert_eq!(order.lines()[1].subtotal, 150);
        assert_eq!(order.total_amount(), 750);
        assert_eq!(order.status(), OrderStatus::Pending);
        assert!(order.lines().iter().all(|l| l.order_id == order.id()));
    }

    #[test]
    fn create_rejects_empty_and_invalid_lines() {
        let empty = Order::create(
            OrderId::new(1),
            UserId::new(7),
            OrderNo::from_id(1),
            &[],
            line_ids(),
            Utc::now(),
        );
        assert!(matches!(empty, Err(DomainError::Validation(_))));

        let zero_qty = Order::create(
            OrderId::new(1),
            UserId::new(7),
            OrderNo::from_id(1),
            &[draft(1, 0, 10)],
            line_ids(),
            Utc::now(),
        );
        assert!(zero_qty.is_err());
    }

    #[test]
    fn overflowing_subtotal_is_rejected() {
        let res = Order::create(
            OrderId::new(1),
            UserId::new(7),
            OrderNo::from_id(1),
            &[draft(1, i64::MAX, 2)],
            line_ids(),
            Utc::now(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn pay_moves_pending_to_paid_once() {
        let mut order = pending_order();
        let at = Utc::now();
        order.pay(at).unwrap();
        assert!(order.is_paid());
        assert_eq!(order.paid_at(), Some(at));
        assert!(matches!(order.pay(at), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn cancelled_order_cannot_be_paid_or_cancelled_again() {
        let mut order = pending_order();
        order.cancel().unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert!(order.status().is_terminal());
        assert!(order.pay(Utc::now()).is_err());
        assert!(order.cancel().is_err());
    }

    #[test]
    fn paid_order_cannot_be_cancelled() {
        let mut order = pending_order();
        order.pay(Utc::now()).unwrap();
        assert!(order.cancel().is_err());
    }

    #[test]
    fn ownership_is_checked() {
        let order = pending_order();
        assert!(order.ensure_owned_by(UserId::new(7)).is_ok());
        assert_eq!(
            order.ensure_owned_by(UserId::new(8)),
            Err(DomainError::Forbidden)
        );
    }

    #[test]
    fn restore_rejects_inconsistent_total() {
        let order = pending_order();
        let res = Order::restore(
            order.id(),
            order.user_id(),
            order.order_no().clone(),
            order.total_amount() + 1,
            order.status(),
            None,
            order.created_at(),
            order.lines().to_vec(),
        );
        assert!(matches!(res, Err(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn status_codes_match_storage_encoding() {
        for s in [OrderStatus::Pending, OrderStatus::Paid, OrderStatus::Cancelled] {
            assert_eq!(OrderStatus::from_code(s.as_code()).unwrap(), s);
        }
        assert!(OrderStatus::from_code(9).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the total always equals the sum of subtotals, and each
        /// subtotal equals quantity x unit price.
        #[test]
        fn total_equals_sum_of_subtotals(
            lines in prop::collection::vec((1i64..1_000, 1i64..100, 0i64..100_000), 1..10)
        ) {
            let drafts: Vec<LineDraft> = lines
                .iter()
                .map(|(item, q, p)| draft(*item, *q, *p))
                .collect();
            let order = Order::create(
                OrderId::new(1),
                UserId::new(1),
                OrderNo::from_id(1),
                &drafts,
                line_ids(),
                Utc::now(),
            ).unwrap();

            let sum: i64 = order.lines().iter().map(|l| l.subtotal).sum();
            prop_assert_eq!(order.total_amount(), sum);
            for l in order.lines() {
                prop_assert_eq!(l.subtotal, l.quantity * l.unit_price);
            }
        }
    }
}
