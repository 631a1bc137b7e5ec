//! Postgres-backed durable store.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | `StoreError` |
//! |------------|-----------------|--------------|
//! | Io / Tls / Protocol / PoolTimedOut / PoolClosed / WorkerCrashed | N/A | `Unavailable` |
//! | Database (connection exception) | `08xxx` | `Unavailable` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Unavailable` |
//! | Database (admin shutdown / too many connections) | `57P01` / `53300` | `Unavailable` |
//! | Database (other) | any other | `Query` |
//! | Decode / ColumnDecode / ColumnNotFound | N/A | `Corrupt` |
//! | RowNotFound | N/A | `Domain(NotFound)` |
//!
//! Business refusals (missing/withdrawn item, insufficient stock, illegal
//! status transitions) are detected inside the transaction, which is rolled
//! back, and surface as `StoreError::Domain`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, instrument};

use flashsale_core::{DomainError, ItemId, OrderId, OrderLineId, OrderNo, UserId};
use flashsale_inventory::{Item, ItemStatus};
use flashsale_sales::{Order, OrderLine, OrderStatus};

use super::{InsertOutcome, ItemRepository, OrderPage, OrderRepository, Page, StoreError};

const MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("migrations failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ItemRepository for PostgresStore {
    #[instrument(skip_all, fields(item_id = %id), err)]
    async fn find_item(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, title, price, stock, sale, status, created_at
            FROM items
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_item", e))?;

        row.as_ref().map(item_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, price, stock, sale, status, created_at
            FROM items
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_items", e))?;

        rows.iter().map(item_from_row).collect()
    }
}

#[async_trait]
impl OrderRepository for PostgresStore {
    #[instrument(
        skip(self, order),
        fields(order_no = %order.order_no(), order_id = %order.id(), line_count = order.lines().len()),
        err
    )]
    async fn insert_order(&self, order: &Order) -> Result<InsertOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO orders (id, user_id, order_no, total_amount, status, is_paid, paid_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (order_no) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(order.id().get())
        .bind(order.user_id().get())
        .bind(order.order_no().as_str())
        .bind(order.total_amount())
        .bind(order.status().as_code())
        .bind(order.is_paid())
        .bind(order.paid_at())
        .bind(order.created_at())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Query(format!("order id {} already exists", order.id()))
            } else {
                map_sqlx_error("insert_order", e)
            }
        })?;

        if inserted.is_none() {
            let existing: i64 = sqlx::query_scalar("SELECT id FROM orders WHERE order_no = $1")
                .bind(order.order_no().as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("find_duplicate", e))?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!(existing_id = existing, "order number already stored");
            return Ok(InsertOutcome::Duplicate(OrderId::new(existing)));
        }

        for line in order.lines() {
            let taken = sqlx::query(
                r#"
                UPDATE items
                SET stock = stock - $2
                WHERE id = $1 AND status = 1 AND stock >= $2
                "#,
            )
            .bind(line.item_id.get())
            .bind(line.quantity)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("take_stock", e))?
            .rows_affected();

            if taken == 0 {
                let refusal = explain_stock_refusal(&mut tx, line.item_id, line.quantity).await?;
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::Domain(refusal));
            }

            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, item_id, quantity, price, subtotal)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(line.id.get())
            .bind(line.order_id.get())
            .bind(line.item_id.get())
            .bind(line.quantity)
            .bind(line.unit_price)
            .bind(line.subtotal)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_line", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(InsertOutcome::Created(order.id()))
    }

    #[instrument(skip_all, fields(order_id = %id), err)]
    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, order_no, total_amount, status, paid_at, created_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_id", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        let mut lines = fetch_lines(&mut conn, &[id.get()]).await?;
        order_from_row(&row, lines.remove(&id.get()).unwrap_or_default()).map(Some)
    }

    #[instrument(skip_all, fields(order_no = %order_no), err)]
    async fn find_by_order_no(&self, order_no: &OrderNo) -> Result<Option<Order>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM orders WHERE order_no = $1")
            .bind(order_no.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_order_no", e))?;

        match id {
            Some(id) => self.find_by_id(OrderId::new(id)).await,
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(user_id = %user_id, page = page.page), err)]
    async fn list_for_user(&self, user_id: UserId, page: Page) -> Result<OrderPage, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE user_id = $1")
            .bind(user_id.get())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_orders", e))?;

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, order_no, total_amount, status, paid_at, created_at
            FROM orders
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id.get())
        .bind(i64::from(page.page_size))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_for_user", e))?;

        let ids = rows
            .iter()
            .map(|r| r.try_get::<i64, _>("id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("list_for_user", e))?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        let mut lines = fetch_lines(&mut conn, &ids).await?;

        let orders = rows
            .iter()
            .zip(&ids)
            .map(|(row, id)| order_from_row(row, lines.remove(id).unwrap_or_default()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(OrderPage {
            orders,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    #[instrument(skip_all, fields(order_id = %id), err)]
    async fn mark_paid(&self, id: OrderId, at: DateTime<Utc>) -> Result<Order, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut order = lock_order(&mut tx, id).await?;
        order.pay(at)?;

        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, is_paid = TRUE, paid_at = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(order.status().as_code())
        .bind(order.paid_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_paid", e))?;

        for line in order.lines() {
            sqlx::query("UPDATE items SET sale = sale + $2 WHERE id = $1")
                .bind(line.item_id.get())
                .bind(line.quantity)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("record_sale", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(order)
    }

    #[instrument(skip_all, fields(order_id = %id), err)]
    async fn mark_cancelled(&self, id: OrderId) -> Result<Order, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut order = lock_order(&mut tx, id).await?;
        order.cancel()?;

        sqlx::query("UPDATE orders SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id.get())
            .bind(order.status().as_code())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_cancelled", e))?;

        for line in order.lines() {
            sqlx::query("UPDATE items SET stock = stock + $2 WHERE id = $1")
                .bind(line.item_id.get())
                .bind(line.quantity)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("restore_stock", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(order)
    }
}

/// Load an order with its lines, holding a row lock until the transaction ends.
async fn lock_order(conn: &mut PgConnection, id: OrderId) -> Result<Order, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, order_no, total_amount, status, paid_at, created_at
        FROM orders
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(id.get())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lock_order", e))?
    .ok_or(DomainError::NotFound)?;

    let mut lines = fetch_lines(conn, &[id.get()]).await?;
    order_from_row(&row, lines.remove(&id.get()).unwrap_or_default())
}

async fn fetch_lines(
    conn: &mut PgConnection,
    order_ids: &[i64],
) -> Result<HashMap<i64, Vec<OrderLine>>, StoreError> {
    let mut by_order: HashMap<i64, Vec<OrderLine>> = HashMap::new();
    if order_ids.is_empty() {
        return Ok(by_order);
    }

    let rows = sqlx::query(
        r#"
        SELECT id, order_id, item_id, quantity, price, subtotal
        FROM order_items
        WHERE order_id = ANY($1)
        ORDER BY id ASC
        "#,
    )
    .bind(order_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("fetch_lines", e))?;

    for row in &rows {
        let line = OrderLine {
            id: OrderLineId::new(get(row, "id")?),
            order_id: OrderId::new(get(row, "order_id")?),
            item_id: ItemId::new(get(row, "item_id")?),
            quantity: get(row, "quantity")?,
            unit_price: get(row, "price")?,
            subtotal: get(row, "subtotal")?,
        };
        by_order.entry(line.order_id.get()).or_default().push(line);
    }
    Ok(by_order)
}

async fn explain_stock_refusal(
    conn: &mut PgConnection,
    item_id: ItemId,
    requested: i64,
) -> Result<DomainError, StoreError> {
    let row = sqlx::query("SELECT stock, status FROM items WHERE id = $1")
        .bind(item_id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("explain_stock_refusal", e))?;

    let Some(row) = row else {
        return Ok(DomainError::NotFound);
    };
    let stock: i64 = get(&row, "stock")?;
    let status: i16 = get(&row, "status")?;
    Ok(if ItemStatus::from_code(status) != ItemStatus::Active {
        DomainError::withdrawn(format!("item {item_id}"))
    } else {
        DomainError::out_of_stock(format!(
            "item {item_id} has {stock} left, {requested} requested"
        ))
    })
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Corrupt(format!("column {column}: {e}")))
}

fn item_from_row(row: &PgRow) -> Result<Item, StoreError> {
    Ok(Item {
        id: ItemId::new(get(row, "id")?),
        title: get(row, "title")?,
        price: get(row, "price")?,
        stock: get(row, "stock")?,
        sale: get(row, "sale")?,
        status: ItemStatus::from_code(get(row, "status")?),
        created_at: get(row, "created_at")?,
    })
}

fn order_from_row(row: &PgRow, lines: Vec<OrderLine>) -> Result<Order, StoreError> {
    let corrupt = |e: DomainError| StoreError::Corrupt(e.to_string());

    let order_no = OrderNo::parse(get::<String>(row, "order_no")?).map_err(corrupt)?;
    let status = OrderStatus::from_code(get(row, "status")?).map_err(corrupt)?;

    Order::restore(
        OrderId::new(get(row, "id")?),
        UserId::new(get(row, "user_id")?),
        order_no,
        get(row, "total_amount")?,
        status,
        get(row, "paid_at")?,
        get(row, "created_at")?,
        lines,
    )
    .map_err(corrupt)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            StoreError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::Database(ref db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some(code)
                    if code.starts_with("08")
                        || matches!(code, "40001" | "40P01" | "57P01" | "53300") =>
                {
                    StoreError::Unavailable(msg)
                }
                _ => StoreError::Query(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::Domain(DomainError::NotFound),
        sqlx::Error::Decode(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("{operation}: {err}"))
        }
        other => StoreError::Query(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
