use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use flashsale_core::{DomainError, ItemId, OrderId, OrderNo, UserId};
use flashsale_inventory::Item;
use flashsale_sales::Order;

use super::{InsertOutcome, ItemRepository, OrderPage, OrderRepository, Page, StoreError};

#[derive(Debug, Default)]
struct State {
    items: HashMap<ItemId, Item>,
    orders: HashMap<OrderId, Order>,
    by_order_no: HashMap<OrderNo, OrderId>,
}

/// In-memory durable store (items + orders).
///
/// Intended for tests/dev. Mirrors the transactional and uniqueness behavior
/// of the Postgres store, with failure injection for the transient paths.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
    refuse_queries: AtomicBool,
    fail_next: AtomicU32,
    lose_next_commit: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an item.
    pub fn put_item(&self, item: Item) {
        if let Ok(mut state) = self.state.write() {
            state.items.insert(item.id, item);
        }
    }

    pub fn item(&self, id: ItemId) -> Option<Item> {
        self.state.read().ok()?.items.get(&id).cloned()
    }

    pub fn order_count(&self) -> usize {
        self.state.read().map(|s| s.orders.len()).unwrap_or(0)
    }

    /// Fail every operation until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Answer every operation with a query error, as a store would after a
    /// schema mismatch.
    pub fn set_refusing_queries(&self, refusing: bool) {
        self.refuse_queries.store(refusing, Ordering::SeqCst);
    }

    /// Fail the next `n` operations.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Let the next order insert commit, then report a transient failure as if
    /// the acknowledgement of the commit was lost.
    pub fn lose_next_commit(&self) {
        self.lose_next_commit.store(true, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        if self.refuse_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Query("in-memory store refusing queries".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.check_available()?;
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.check_available()?;
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

/// Apply `f` to a copy of every item the order touches, committing the copies
/// only if every line succeeds.
fn update_items<F>(state: &mut State, order: &Order, mut f: F) -> Result<(), StoreError>
where
    F: FnMut(&mut Item, i64) -> Result<(), DomainError>,
{
    let mut touched: HashMap<ItemId, Item> = HashMap::new();
    for line in order.lines() {
        let item = match touched.entry(line.item_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => v.insert(
                state
                    .items
                    .get(&line.item_id)
                    .cloned()
                    .ok_or(DomainError::NotFound)?,
            ),
        };
        f(item, line.quantity)?;
    }
    state.items.extend(touched);
    Ok(())
}

#[async_trait]
impl ItemRepository for InMemoryStore {
    async fn find_item(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        Ok(self.read()?.items.get(&id).cloned())
    }

    async fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        let mut items: Vec<Item> = self.read()?.items.values().cloned().collect();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn insert_order(&self, order: &Order) -> Result<InsertOutcome, StoreError> {
        let mut state = self.write()?;

        if let Some(existing) = state.by_order_no.get(order.order_no()) {
            return Ok(InsertOutcome::Duplicate(*existing));
        }
        if state.orders.contains_key(&order.id()) {
            return Err(StoreError::Query(format!("order id {} already exists", order.id())));
        }

        update_items(&mut state, order, |item, quantity| item.take_stock(quantity))?;
        state.by_order_no.insert(order.order_no().clone(), order.id());
        state.orders.insert(order.id(), order.clone());

        if self.lose_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection lost after commit".to_string()));
        }
        Ok(InsertOutcome::Created(order.id()))
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.read()?.orders.get(&id).cloned())
    }

    async fn find_by_order_no(&self, order_no: &OrderNo) -> Result<Option<Order>, StoreError> {
        let state = self.read()?;
        Ok(state
            .by_order_no
            .get(order_no)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn list_for_user(&self, user_id: UserId, page: Page) -> Result<OrderPage, StoreError> {
        let state = self.read()?;
        let mut orders: Vec<&Order> = state
            .orders
            .values()
            .filter(|o| o.user_id() == user_id)
            .collect();
        orders.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });

        let total = orders.len() as u64;
        let skip = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let orders = orders
            .into_iter()
            .skip(skip)
            .take(page.page_size as usize)
            .cloned()
            .collect();
        Ok(OrderPage { orders, total })
    }

    async fn mark_paid(&self, id: OrderId, at: DateTime<Utc>) -> Result<Order, StoreError> {
        let mut state = self.write()?;
        let mut order = state.orders.get(&id).cloned().ok_or(DomainError::NotFound)?;
        order.pay(at)?;
        update_items(&mut state, &order, |item, quantity| {
            item.record_sale(quantity);
            Ok(())
        })?;
        state.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn mark_cancelled(&self, id: OrderId) -> Result<Order, StoreError> {
        let mut state = self.write()?;
        let mut order = state.orders.get(&id).cloned().ok_or(DomainError::NotFound)?;
        order.cancel()?;
        update_items(&mut state, &order, |item, quantity| item.restore_stock(quantity))?;
        state.orders.insert(id, order.clone());
        Ok(order)
    }
}
