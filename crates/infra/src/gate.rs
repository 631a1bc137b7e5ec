//! Inventory gate: admission decisions against the fast-store stock mirror.
//!
//! `reserve` is one atomic decrement. A negative result is undone with an
//! atomic increment of the same quantity and reported as out of stock; no
//! lock is taken at any point, so concurrent callers can briefly observe a
//! negative counter but can never be admitted past the initial stock.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use flashsale_core::ItemId;

use crate::fast_store::{FastStore, FastStoreError};
use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfStock {
    pub item_id: ItemId,
    pub requested: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Accepted { remaining: i64 },
    Rejected(OutOfStock),
}

impl Reservation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Reservation::Accepted { .. })
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    /// No stock counter exists for the item (the mirror was never warmed up).
    /// Callers must treat this as a refusal.
    #[error("stock counter for item {0} is not initialized")]
    Uninitialized(ItemId),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i64),

    #[error(transparent)]
    Store(#[from] FastStoreError),
}

#[derive(Clone)]
pub struct InventoryGate {
    store: Arc<dyn FastStore>,
}

impl std::fmt::Debug for InventoryGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryGate").finish_non_exhaustive()
    }
}

impl InventoryGate {
    pub fn new(store: Arc<dyn FastStore>) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(item_id = %item_id), err)]
    pub async fn reserve(&self, item_id: ItemId, quantity: i64) -> Result<Reservation, GateError> {
        if quantity <= 0 {
            return Err(GateError::InvalidQuantity(quantity));
        }
        let key = keys::stock(item_id);

        let remaining = self
            .store
            .decr_existing(&key, quantity)
            .await?
            .ok_or(GateError::Uninitialized(item_id))?;

        if remaining >= 0 {
            debug!(remaining, "reservation accepted");
            return Ok(Reservation::Accepted { remaining });
        }

        // Undo our own decrement only.
        if let Err(err) = self.store.incr_by(&key, quantity).await {
            warn!(error = %err, quantity, "compensating increment failed; mirror is short until rebuild");
            return Err(err.into());
        }
        debug!(quantity, "reservation rejected");
        Ok(Reservation::Rejected(OutOfStock {
            item_id,
            requested: quantity,
        }))
    }

    /// Put `quantity` back into the mirror (cancellation, failed publish).
    #[instrument(skip_all, fields(item_id = %item_id), err)]
    pub async fn release(&self, item_id: ItemId, quantity: i64) -> Result<i64, GateError> {
        if quantity <= 0 {
            return Err(GateError::InvalidQuantity(quantity));
        }
        Ok(self.store.incr_by(&keys::stock(item_id), quantity).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_store::InMemoryFastStore;
    use proptest::prelude::*;

    fn gate_with(item: i64, stock: i64) -> (InventoryGate, Arc<InMemoryFastStore>) {
        let store = Arc::new(InMemoryFastStore::new());
        store.put_counter(&keys::stock(ItemId::new(item)), stock);
        (InventoryGate::new(store.clone()), store)
    }

    #[tokio::test]
    async fn empty_stock_rejects_without_side_effects() {
        let (gate, store) = gate_with(1, 0);
        let r = gate.reserve(ItemId::new(1), 1).await.unwrap();
        assert_eq!(
            r,
            Reservation::Rejected(OutOfStock {
                item_id: ItemId::new(1),
                requested: 1
            })
        );
        assert_eq!(store.counter("stock:1"), Some(0));
    }

    #[tokio::test]
    async fn accepted_reservation_decrements() {
        let (gate, store) = gate_with(1, 5);
        let r = gate.reserve(ItemId::new(1), 1).await.unwrap();
        assert_eq!(r, Reservation::Accepted { remaining: 4 });
        assert_eq!(store.counter("stock:1"), Some(4));
    }

    #[tokio::test]
    async fn partial_quantity_is_not_admitted() {
        let (gate, store) = gate_with(1, 2);
        assert!(!gate.reserve(ItemId::new(1), 3).await.unwrap().is_accepted());
        assert_eq!(store.counter("stock:1"), Some(2));
    }

    #[tokio::test]
    async fn missing_counter_fails_closed() {
        let store = Arc::new(InMemoryFastStore::new());
        let gate = InventoryGate::new(store.clone());
        let err = gate.reserve(ItemId::new(9), 1).await.unwrap_err();
        assert!(matches!(err, GateError::Uninitialized(id) if id == ItemId::new(9)));
        assert_eq!(store.counter("stock:9"), None);
    }

    #[tokio::test]
    async fn store_outage_is_an_error() {
        let (gate, store) = gate_with(1, 5);
        store.set_unavailable(true);
        assert!(matches!(
            gate.reserve(ItemId::new(1), 1).await,
            Err(GateError::Store(FastStoreError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn release_increments_and_rejects_non_positive() {
        let (gate, store) = gate_with(1, 0);
        assert_eq!(gate.release(ItemId::new(1), 2).await.unwrap(), 2);
        assert_eq!(store.counter("stock:1"), Some(2));
        assert!(matches!(
            gate.release(ItemId::new(1), 0).await,
            Err(GateError::InvalidQuantity(0))
        ));
        assert!(gate.reserve(ItemId::new(1), -1).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn last_unit_goes_to_exactly_one_caller() {
        let (gate, store) = gate_with(1, 1);
        let a = tokio::spawn({
            let gate = gate.clone();
            async move { gate.reserve(ItemId::new(1), 1).await.unwrap() }
        });
        let b = tokio::spawn({
            let gate = gate.clone();
            async move { gate.reserve(ItemId::new(1), 1).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(
            [a, b].iter().filter(|r| r.is_accepted()).count(),
            1
        );
        assert_eq!(store.counter("stock:1"), Some(0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn concurrent_reservations_never_oversell(
            stock in 0i64..50,
            requests in proptest::collection::vec(1i64..5, 1..60),
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .build()
                .unwrap();
            let (admitted, final_stock) = rt.block_on(async {
                let (gate, store) = gate_with(1, stock);
                let tasks: Vec<_> = requests
                    .iter()
                    .map(|&qty| {
                        let gate = gate.clone();
                        tokio::spawn(async move {
                            match gate.reserve(ItemId::new(1), qty).await.unwrap() {
                                Reservation::Accepted { .. } => qty,
                                Reservation::Rejected(_) => 0,
                            }
                        })
                    })
                    .collect();
                let mut admitted = 0;
                for t in tasks {
                    admitted += t.await.unwrap();
                }
                (admitted, store.counter("stock:1").unwrap())
            });

            prop_assert!(admitted <= stock);
            prop_assert!(final_stock >= 0);
            prop_assert_eq!(final_stock, stock - admitted);
        }
    }
}
