use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::PoolError;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use num_traits::Zero;
use shared::status::UnknownStatus;
use shared::*;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::{NewOrder, NewOrderItem, Product};
use crate::schema::{order_items, orders, products};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("order has no items")]
    EmptyOrder,

    #[error("invalid quantity {qty} for product {product}")]
    InvalidQuantity { product: String, qty: i32 },

    #[error("product not found: {0}")]
    UnknownProduct(String),

    #[error("order not found: {0}")]
    NotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] DieselError),

    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<PoolError>),

    #[error(transparent)]
    CorruptStatus(#[from] UnknownStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductRef {
    Id(Uuid),
    Sku(String),
}

impl std::fmt::Display for ProductRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProductRef::Id(id) => write!(f, "{id}"),
            ProductRef::Sku(sku) => write!(f, "sku={sku}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLine {
    pub product: ProductRef,
    pub qty: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub sku: String,
    pub price: BigDecimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedOrder {
    pub order_id: Uuid,
    pub total_amount: BigDecimal,
    /// The external id was already known. Nothing was written.
    pub existed: bool,
    /// Priced lines of a new order; empty when `existed`.
    pub items: Vec<LineItem>,
}

impl CreatedOrder {
    fn existing(order_id: Uuid, total_amount: BigDecimal) -> Self {
        Self {
            order_id,
            total_amount,
            existed: true,
            items: Vec::new(),
        }
    }
}

/// Prices every line from the catalog. Client-side prices never reach here.
pub fn price_lines(
    lines: &[OrderLine],
    catalog: &[CatalogEntry],
) -> Result<(Vec<LineItem>, BigDecimal), LedgerError> {
    if lines.is_empty() {
        return Err(LedgerError::EmptyOrder);
    }

    let mut items = Vec::with_capacity(lines.len());
    let mut total = BigDecimal::zero();
    for line in lines {
        let entry = catalog
            .iter()
            .find(|entry| match &line.product {
                ProductRef::Id(id) => entry.id == *id,
                ProductRef::Sku(sku) => entry.sku == *sku,
            })
            .ok_or_else(|| LedgerError::UnknownProduct(line.product.to_string()))?;
        if line.qty <= 0 {
            return Err(LedgerError::InvalidQuantity {
                product: line.product.to_string(),
                qty: line.qty,
            });
        }

        total += &entry.price * BigDecimal::from(line.qty);
        items.push(LineItem {
            product_id: entry.id,
            qty: line.qty,
            unit_price: entry.price.clone(),
        });
    }
    Ok((items, total))
}

pub fn by_id(items: &[ItemQty]) -> Vec<OrderLine> {
    items
        .iter()
        .map(|item| OrderLine {
            product: ProductRef::Id(item.product_id),
            qty: item.qty,
        })
        .collect()
}

pub fn by_sku<'a>(items: impl IntoIterator<Item = (&'a str, i32)>) -> Vec<OrderLine> {
    items
        .into_iter()
        .map(|(sku, qty)| OrderLine {
            product: ProductRef::Sku(sku.to_string()),
            qty,
        })
        .collect()
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Creates the order, or returns the original one if `external_id` is known.
    async fn create_order(
        &self,
        external_id: &str,
        user_id: &str,
        lines: Vec<OrderLine>,
    ) -> Result<CreatedOrder, LedgerError>;

    async fn order_status(&self, order_id: Uuid) -> Result<CachedStatus, LedgerError>;

    async fn list_products(&self) -> Result<Vec<Product>, LedgerError>;
}

#[derive(Clone)]
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<CreatedOrder>, LedgerError> {
        let mut conn = self.pool.get().await?;
        let existing: Option<(Uuid, BigDecimal)> = orders::table
            .filter(orders::external_id.eq(external_id))
            .select((orders::id, orders::total_amount))
            .first(&mut conn)
            .await
            .optional()?;
        Ok(existing.map(|(id, total)| CreatedOrder::existing(id, total)))
    }
}

fn is_unique_violation(e: &LedgerError) -> bool {
    matches!(
        e,
        LedgerError::Database(DieselError::DatabaseError(
            DatabaseErrorKind::UniqueViolation,
            _
        ))
    )
}

#[async_trait]
impl Ledger for PgLedger {
    async fn create_order(
        &self,
        external_id: &str,
        user_id: &str,
        lines: Vec<OrderLine>,
    ) -> Result<CreatedOrder, LedgerError> {
        if let Some(existing) = self.find_by_external_id(external_id).await? {
            info!(external_id, order_id = %existing.order_id, "Order already exists");
            return Ok(existing);
        }
        if lines.is_empty() {
            return Err(LedgerError::EmptyOrder);
        }

        let external = external_id.to_string();
        let user = user_id.to_string();
        let mut conn = self.pool.get().await?;
        let created = conn
            .transaction::<_, LedgerError, _>(|conn| {
                async move {
                    let ids: Vec<Uuid> = lines
                        .iter()
                        .filter_map(|l| match &l.product {
                            ProductRef::Id(id) => Some(*id),
                            ProductRef::Sku(_) => None,
                        })
                        .collect();
                    let skus: Vec<String> = lines
                        .iter()
                        .filter_map(|l| match &l.product {
                            ProductRef::Sku(sku) => Some(sku.clone()),
                            ProductRef::Id(_) => None,
                        })
                        .collect();

                    let catalog: Vec<CatalogEntry> = products::table
                        .filter(products::id.eq_any(ids).or(products::sku.eq_any(skus)))
                        .select((products::id, products::sku, products::price))
                        .load::<(Uuid, String, BigDecimal)>(conn)
                        .await?
                        .into_iter()
                        .map(|(id, sku, price)| CatalogEntry { id, sku, price })
                        .collect();

                    let (items, total) = price_lines(&lines, &catalog)?;
                    let order_id = Uuid::new_v4();
                    let now = Utc::now();

                    diesel::insert_into(orders::table)
                        .values(&NewOrder {
                            id: order_id,
                            external_id: external,
                            user_id: user,
                            status: OrderStatus::Created.as_str().to_string(),
                            total_amount: total.clone(),
                            created_at: now,
                            updated_at: now,
                        })
                        .execute(conn)
                        .await?;

                    let rows: Vec<NewOrderItem> = items
                        .iter()
                        .map(|item| NewOrderItem {
                            id: Uuid::new_v4(),
                            order_id,
                            product_id: item.product_id,
                            qty: item.qty,
                            unit_price: item.unit_price.clone(),
                        })
                        .collect();
                    diesel::insert_into(order_items::table)
                        .values(&rows)
                        .execute(conn)
                        .await?;

                    Ok(CreatedOrder {
                        order_id,
                        total_amount: total,
                        existed: false,
                        items,
                    })
                }
                .scope_boxed()
            })
            .await;

        match created {
            Err(e) if is_unique_violation(&e) => {
                // Lost a race on external_id; the winner's order is the answer.
                match self.find_by_external_id(external_id).await? {
                    Some(existing) => Ok(existing),
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    async fn order_status(&self, order_id: Uuid) -> Result<CachedStatus, LedgerError> {
        let mut conn = self.pool.get().await?;
        let row: Option<(String, chrono::DateTime<Utc>)> = orders::table
            .find(order_id)
            .select((orders::status, orders::updated_at))
            .first(&mut conn)
            .await
            .optional()?;
        let (status, updated_at) = row.ok_or(LedgerError::NotFound(order_id))?;
        Ok(CachedStatus {
            status: status.parse()?,
            updated_at,
        })
    }

    async fn list_products(&self) -> Result<Vec<Product>, LedgerError> {
        let mut conn = self.pool.get().await?;
        let products = products::table
            .order(products::sku.asc())
            .select(Product::as_select())
            .load(&mut conn)
            .await?;
        Ok(products)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        orders: HashMap<String, (Uuid, BigDecimal)>,
        statuses: HashMap<Uuid, OrderStatus>,
    }

    pub struct InMemoryLedger {
        catalog: Vec<Product>,
        state: Mutex<State>,
        pub fail: bool,
    }

    impl InMemoryLedger {
        pub fn new(catalog: Vec<Product>) -> Self {
            Self {
                catalog,
                state: Mutex::new(State::default()),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Vec::new())
            }
        }

        pub fn set_status(&self, order_id: Uuid, status: OrderStatus) {
            self.state.lock().unwrap().statuses.insert(order_id, status);
        }
    }

    #[async_trait]
    impl Ledger for InMemoryLedger {
        async fn create_order(
            &self,
            external_id: &str,
            _user_id: &str,
            lines: Vec<OrderLine>,
        ) -> Result<CreatedOrder, LedgerError> {
            if self.fail {
                return Err(LedgerError::Database(DieselError::BrokenTransactionManager));
            }
            let mut state = self.state.lock().unwrap();
            if let Some((id, total)) = state.orders.get(external_id) {
                return Ok(CreatedOrder::existing(*id, total.clone()));
            }

            let catalog: Vec<CatalogEntry> = self
                .catalog
                .iter()
                .map(|p| CatalogEntry {
                    id: p.id,
                    sku: p.sku.clone(),
                    price: p.price.clone(),
                })
                .collect();
            let (items, total) = price_lines(&lines, &catalog)?;
            let order_id = Uuid::new_v4();
            state
                .orders
                .insert(external_id.to_string(), (order_id, total.clone()));
            state.statuses.insert(order_id, OrderStatus::Created);
            Ok(CreatedOrder {
                order_id,
                total_amount: total,
                existed: false,
                items,
            })
        }

        async fn order_status(&self, order_id: Uuid) -> Result<CachedStatus, LedgerError> {
            let state = self.state.lock().unwrap();
            state
                .statuses
                .get(&order_id)
                .map(|status| CachedStatus::now(*status))
                .ok_or(LedgerError::NotFound(order_id))
        }

        async fn list_products(&self) -> Result<Vec<Product>, LedgerError> {
            let mut products = self.catalog.clone();
            products.sort_by(|a, b| a.sku.cmp(&b.sku));
            Ok(products)
        }
    }
}
