//! All-or-nothing stock reservation and its compensation.
//!
//! Product rows are locked `FOR UPDATE` one by one in the order the items were
//! given. Every shortfall is collected before the transaction is rolled back, so a
//! rejection always reports the full picture. A reservation row is the durable
//! proof that stock was taken for an `(order, product)` pair; seeing one means the
//! item must not be decremented again.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::PoolError;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::status::UnknownStatus;
use shared::*;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{NewReservation, RELEASED, RESERVED};
use crate::schema::{orders, products, reservations};

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<PoolError>),

    #[error(transparent)]
    CorruptStatus(#[from] UnknownStatus),

    #[error(transparent)]
    InvalidLine(#[from] LineError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("invalid quantity {qty} for product {product_id}")]
    InvalidQuantity { product_id: Uuid, qty: i32 },

    #[error("total quantity for product {product_id} overflows")]
    QuantityOverflow { product_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Every item already had a `RESERVED` row. Nothing was touched.
    AlreadyReserved,
    Reserved,
    /// Nothing was committed.
    Rejected(Vec<Shortfall>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: OrderStatus },
    Unchanged,
    Illegal { from: OrderStatus },
    NotFound,
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// `true` when a `RESERVED` row exists for every item of the order.
    async fn already_reserved(&self, order_id: Uuid, items: &[ItemQty]) -> Result<bool, ReservationError>;

    async fn reserve_all(&self, order_id: Uuid, items: &[ItemQty]) -> Result<ReserveOutcome, ReservationError>;

    /// Returns stock held by the order and flips its rows to `RELEASED`. Returns
    /// what was released; a repeated call releases nothing.
    async fn release_all(&self, order_id: Uuid) -> Result<Vec<ItemQty>, ReservationError>;

    /// Moves the order to `to` if the state machine allows it.
    async fn transition_status(&self, order_id: Uuid, to: OrderStatus) -> Result<Transition, ReservationError>;
}

/// Folds repeated products into one line, keeping first-seen order. Every
/// quantity must be positive and each folded total must fit in an `i32`.
pub fn merge_lines(items: &[ItemQty]) -> Result<Vec<ItemQty>, LineError> {
    let mut merged: Vec<ItemQty> = Vec::with_capacity(items.len());
    for item in items {
        if item.qty <= 0 {
            return Err(LineError::InvalidQuantity {
                product_id: item.product_id,
                qty: item.qty,
            });
        }
        match merged.iter_mut().find(|m| m.product_id == item.product_id) {
            Some(line) => {
                line.qty = line
                    .qty
                    .checked_add(item.qty)
                    .ok_or(LineError::QuantityOverflow {
                        product_id: item.product_id,
                    })?;
            }
            None => merged.push(item.clone()),
        }
    }
    Ok(merged)
}

enum ReserveTxError {
    Shortfall(Vec<Shortfall>),
    Database(diesel::result::Error),
}

impl From<diesel::result::Error> for ReserveTxError {
    fn from(e: diesel::result::Error) -> Self {
        ReserveTxError::Database(e)
    }
}

#[derive(Clone)]
pub struct PgReservationStore {
    pool: DbPool,
}

impl PgReservationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    async fn already_reserved(&self, order_id: Uuid, items: &[ItemQty]) -> Result<bool, ReservationError> {
        let lines = merge_lines(items)?;
        if lines.is_empty() {
            return Ok(false);
        }
        let product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();

        let mut conn = self.pool.get().await?;
        let held: i64 = reservations::table
            .filter(reservations::order_id.eq(order_id))
            .filter(reservations::status.eq(RESERVED))
            .filter(reservations::product_id.eq_any(product_ids))
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(held as usize == lines.len())
    }

    async fn reserve_all(&self, order_id: Uuid, items: &[ItemQty]) -> Result<ReserveOutcome, ReservationError> {
        let lines = merge_lines(items)?;
        if self.already_reserved(order_id, items).await? {
            return Ok(ReserveOutcome::AlreadyReserved);
        }

        let mut conn = self.pool.get().await?;
        let result = conn
            .transaction::<_, ReserveTxError, _>(|conn| {
                async move {
                    let mut shortfalls = Vec::new();

                    for line in &lines {
                        let stock: Option<i32> = products::table
                            .find(line.product_id)
                            .select(products::stock)
                            .for_update()
                            .get_result(conn)
                            .await
                            .optional()?;
                        let Some(stock) = stock else {
                            shortfalls.push(Shortfall {
                                product_id: line.product_id,
                                required: line.qty,
                                available: 0,
                            });
                            continue;
                        };

                        // Written under the same product lock, so this read is current.
                        let held: i64 = reservations::table
                            .filter(reservations::order_id.eq(order_id))
                            .filter(reservations::product_id.eq(line.product_id))
                            .count()
                            .get_result(conn)
                            .await?;
                        if held > 0 {
                            continue;
                        }

                        if stock < line.qty {
                            shortfalls.push(Shortfall {
                                product_id: line.product_id,
                                required: line.qty,
                                available: stock,
                            });
                            continue;
                        }

                        let updated = diesel::update(products::table.find(line.product_id))
                            .set((
                                products::stock.eq(products::stock - line.qty),
                                products::updated_at.eq(Utc::now()),
                            ))
                            .execute(conn)
                            .await?;
                        if updated != 1 {
                            shortfalls.push(Shortfall {
                                product_id: line.product_id,
                                required: line.qty,
                                available: stock,
                            });
                            continue;
                        }

                        diesel::insert_into(reservations::table)
                            .values(&NewReservation {
                                id: Uuid::new_v4(),
                                order_id,
                                product_id: line.product_id,
                                qty: line.qty,
                                status: RESERVED.to_string(),
                            })
                            .on_conflict((reservations::order_id, reservations::product_id))
                            .do_nothing()
                            .execute(conn)
                            .await?;
                    }

                    if shortfalls.is_empty() {
                        Ok(())
                    } else {
                        Err(ReserveTxError::Shortfall(shortfalls))
                    }
                }
                .scope_boxed()
            })
            .await;

        match result {
            Ok(()) => Ok(ReserveOutcome::Reserved),
            Err(ReserveTxError::Shortfall(shortfalls)) => Ok(ReserveOutcome::Rejected(shortfalls)),
            Err(ReserveTxError::Database(e)) => Err(e.into()),
        }
    }

    async fn release_all(&self, order_id: Uuid) -> Result<Vec<ItemQty>, ReservationError> {
        let mut conn = self.pool.get().await?;
        let released = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let held: Vec<(Uuid, Uuid, i32)> = reservations::table
                        .filter(reservations::order_id.eq(order_id))
                        .filter(reservations::status.eq(RESERVED))
                        .order(reservations::product_id.asc())
                        .select((reservations::id, reservations::product_id, reservations::qty))
                        .for_update()
                        .load(conn)
                        .await?;
                    if held.is_empty() {
                        return Ok(Vec::new());
                    }

                    let now = Utc::now();
                    for (_, product_id, qty) in &held {
                        diesel::update(products::table.find(*product_id))
                            .set((
                                products::stock.eq(products::stock + *qty),
                                products::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;
                    }

                    let ids: Vec<Uuid> = held.iter().map(|(id, _, _)| *id).collect();
                    diesel::update(reservations::table.filter(reservations::id.eq_any(ids)))
                        .set((
                            reservations::status.eq(RELEASED),
                            reservations::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                    Ok(held
                        .into_iter()
                        .map(|(_, product_id, qty)| ItemQty { product_id, qty })
                        .collect())
                }
                .scope_boxed()
            })
            .await?;

        Ok(released)
    }

    async fn transition_status(&self, order_id: Uuid, to: OrderStatus) -> Result<Transition, ReservationError> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, ReservationError, _>(|conn| {
            async move {
                let current: Option<String> = orders::table
                    .find(order_id)
                    .select(orders::status)
                    .for_update()
                    .get_result(conn)
                    .await
                    .optional()?;
                let Some(current) = current else {
                    return Ok(Transition::NotFound);
                };

                let from: OrderStatus = current.parse()?;
                if from == to {
                    return Ok(Transition::Unchanged);
                }
                if !can_transition(from, to) {
                    return Ok(Transition::Illegal { from });
                }

                diesel::update(orders::table.find(order_id))
                    .set((
                        orders::status.eq(to.as_str()),
                        orders::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;
                Ok(Transition::Applied { from })
            }
            .scope_boxed()
        })
        .await
    }
}
