//! Order ledger against a real Postgres.
//!
//! Needs Docker:
//!
//! ```bash
//! cargo test -p order-service --test ledger_pg -- --ignored
//! ```

use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use order_service::ledger::{by_id, by_sku, Ledger, LedgerError, PgLedger};
use order_service::schema::{order_items, orders};
use shared::*;
use std::str::FromStr;
use std::sync::Arc;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct ContainerInfo {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    database_url: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn container() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let database_url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

            db::run_migrations(&database_url).await.unwrap();

            Arc::new(ContainerInfo {
                container,
                database_url,
            })
        })
        .await
        .clone()
}

async fn ledger() -> (PgLedger, DbPool) {
    let info = container().await;
    let pool = db::connect_pool(&info.database_url, 4).await.unwrap();
    (PgLedger::new(pool.clone()), pool)
}

fn decimal(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap()
}

fn external_id() -> String {
    format!("ext-{}", Uuid::new_v4())
}

async fn sku_id(ledger: &PgLedger, sku: &str) -> Uuid {
    ledger
        .list_products()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.sku == sku)
        .unwrap()
        .id
}

#[tokio::test]
#[ignore = "needs docker"]
async fn total_comes_from_stored_prices() {
    let (ledger, pool) = ledger().await;
    let keyboard = sku_id(&ledger, "SKU-KEYBOARD").await;
    let cable = sku_id(&ledger, "SKU-CABLE").await;

    let created = ledger
        .create_order(
            &external_id(),
            "u-1",
            by_id(&[
                ItemQty { product_id: keyboard, qty: 1 },
                ItemQty { product_id: cable, qty: 2 },
            ]),
        )
        .await
        .unwrap();

    assert!(!created.existed);
    assert_eq!(created.total_amount, decimal("104.40"));
    assert_eq!(created.items.len(), 2);

    let mut conn = pool.get().await.unwrap();
    let (status, total): (String, BigDecimal) = orders::table
        .find(created.order_id)
        .select((orders::status, orders::total_amount))
        .first(&mut conn)
        .await
        .unwrap();
    assert_eq!(status, "CREATED");
    assert_eq!(total, decimal("104.40"));

    let lines: i64 = order_items::table
        .filter(order_items::order_id.eq(created.order_id))
        .count()
        .get_result(&mut conn)
        .await
        .unwrap();
    assert_eq!(lines, 2);
}

#[tokio::test]
#[ignore = "needs docker"]
async fn same_external_id_returns_original_order() {
    let (ledger, _) = ledger().await;
    let ext = external_id();

    let first = ledger
        .create_order(&ext, "u-1", by_sku([("SKU-MOUSE", 1)]))
        .await
        .unwrap();
    let second = ledger
        .create_order(&ext, "u-1", by_sku([("SKU-MONITOR", 3)]))
        .await
        .unwrap();

    assert!(!first.existed);
    assert!(second.existed);
    assert_eq!(first.order_id, second.order_id);
    assert_eq!(second.total_amount, decimal("24.50"));
    assert!(second.items.is_empty());
}

#[tokio::test]
#[ignore = "needs docker"]
async fn concurrent_duplicates_create_one_order() {
    let (ledger, pool) = ledger().await;
    let ledger = Arc::new(ledger);
    let ext = external_id();

    let attempts = (0..4).map(|_| {
        let ledger = ledger.clone();
        let ext = ext.clone();
        tokio::spawn(async move {
            ledger
                .create_order(&ext, "u-1", by_sku([("SKU-CABLE", 1)]))
                .await
                .unwrap()
        })
    });
    let mut results = Vec::new();
    for attempt in attempts.collect::<Vec<_>>() {
        results.push(attempt.await.unwrap());
    }

    assert_eq!(results.iter().filter(|r| !r.existed).count(), 1);
    assert!(results.iter().all(|r| r.order_id == results[0].order_id));

    let mut conn = pool.get().await.unwrap();
    let count: i64 = orders::table
        .filter(orders::external_id.eq(&ext))
        .count()
        .get_result(&mut conn)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
#[ignore = "needs docker"]
async fn unknown_product_writes_nothing() {
    let (ledger, pool) = ledger().await;
    let ext = external_id();

    let err = ledger
        .create_order(&ext, "u-1", by_sku([("SKU-MOUSE", 1), ("SKU-MISSING", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::UnknownProduct(_)));

    let err = ledger
        .create_order(&ext, "u-1", by_sku([("SKU-MOUSE", 0)]))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidQuantity { .. }));

    let mut conn = pool.get().await.unwrap();
    let count: i64 = orders::table
        .filter(orders::external_id.eq(&ext))
        .count()
        .get_result(&mut conn)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
#[ignore = "needs docker"]
async fn status_reads_back() {
    let (ledger, _) = ledger().await;
    let created = ledger
        .create_order(&external_id(), "u-1", by_sku([("SKU-CABLE", 1)]))
        .await
        .unwrap();

    let status = ledger.order_status(created.order_id).await.unwrap();
    assert_eq!(status.status, OrderStatus::Created);

    let missing = Uuid::new_v4();
    assert!(matches!(
        ledger.order_status(missing).await,
        Err(LedgerError::NotFound(id)) if id == missing
    ));
}
