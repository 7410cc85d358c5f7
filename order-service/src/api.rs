use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::*;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ledger::{by_id, by_sku, CreatedOrder, Ledger, LedgerError, OrderLine};
use crate::models::Product;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn Ledger>,
    pub producer: Arc<Producer>,
    pub markers: Arc<dyn MarkerStore>,
    pub cache: Arc<dyn StatusCache>,
    pub service_name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub external_id: String,
    pub user_id: String,
    pub items: Vec<ItemQty>,
}

#[derive(Debug, Deserialize)]
pub struct SkuItem {
    pub sku: String,
    pub qty: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderBySkuRequest {
    pub external_id: String,
    pub user_id: String,
    pub items: Vec<SkuItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
    pub total_amount: BigDecimal,
    pub idempotent: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderStatusResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest { reason: &'static str, message: String },
    NotFound(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest { reason, message } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: message,
                    reason: Some(reason.to_string()),
                },
            ),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: message,
                    reason: Some("NOT_FOUND".to_string()),
                },
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse {
                    error: "internal error".to_string(),
                    reason: None,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let bad = |reason: &'static str| ApiError::BadRequest {
            reason,
            message: e.to_string(),
        };
        match &e {
            LedgerError::EmptyOrder => bad("EMPTY_ORDER"),
            LedgerError::InvalidQuantity { .. } => bad("INVALID_QUANTITY"),
            LedgerError::UnknownProduct(_) => bad("UNKNOWN_PRODUCT"),
            LedgerError::NotFound(_) => ApiError::NotFound(e.to_string()),
            LedgerError::Database(_) | LedgerError::Pool(_) | LedgerError::CorruptStatus(_) => {
                error!(error = %e, "Ledger failure");
                ApiError::Internal
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let reason = match rejection {
            JsonRejection::JsonDataError(_) => "MISSING_FIELDS",
            _ => "INVALID_JSON",
        };
        ApiError::BadRequest {
            reason,
            message: rejection.body_text(),
        }
    }
}

fn missing_fields(external_id: &str, user_id: &str) -> Result<(), ApiError> {
    if external_id.trim().is_empty() || user_id.trim().is_empty() {
        return Err(ApiError::BadRequest {
            reason: "MISSING_FIELDS",
            message: "external_id and user_id are required".to_string(),
        });
    }
    Ok(())
}

pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/sku", post(create_order_by_sku))
        .route("/orders/:id", get(get_order))
        .route("/products", get(list_products))
        .route("/healthz", get(health_check))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    let Json(request) = request?;
    missing_fields(&request.external_id, &request.user_id)?;
    let lines = by_id(&request.items);
    place_order(&state, &headers, &request.external_id, &request.user_id, lines).await
}

pub async fn create_order_by_sku(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Result<Json<CreateOrderBySkuRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    let Json(request) = request?;
    missing_fields(&request.external_id, &request.user_id)?;
    let lines = by_sku(request.items.iter().map(|i| (i.sku.as_str(), i.qty)));
    place_order(&state, &headers, &request.external_id, &request.user_id, lines).await
}

async fn place_order(
    state: &AppState,
    headers: &HeaderMap,
    external_id: &str,
    user_id: &str,
    lines: Vec<OrderLine>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    let created = state.ledger.create_order(external_id, user_id, lines).await?;

    if created.existed {
        info!(external_id, order_id = %created.order_id, "Idempotent order replay");
    } else {
        remember_new_order(state, external_id, &created).await;
        publish_order_created(state, headers, external_id, user_id, &created).await?;
        info!(external_id, order_id = %created.order_id, total = %created.total_amount, "Order created");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateOrderResponse {
            order_id: created.order_id,
            total_amount: created.total_amount,
            idempotent: created.existed,
        }),
    ))
}

async fn remember_new_order(state: &AppState, external_id: &str, created: &CreatedOrder) {
    let key = MarkerKey::order_create(external_id);
    remember(state.markers.as_ref(), &key, &created.order_id.to_string()).await;
    let cached = CachedStatus::now(OrderStatus::Created);
    if let Err(e) = state.cache.put(created.order_id, &cached).await {
        warn!(order_id = %created.order_id, error = %e, "Failed to cache order status");
    }
}

async fn publish_order_created(
    state: &AppState,
    headers: &HeaderMap,
    external_id: &str,
    user_id: &str,
    created: &CreatedOrder,
) -> Result<(), ApiError> {
    let payload = OrderCreated {
        order_id: created.order_id,
        external_id: external_id.to_string(),
        user_id: user_id.to_string(),
        items: created.items.clone(),
        total_amount: created.total_amount.clone(),
    };
    let trace_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let envelope = Envelope::new(state.service_name.as_str(), created.order_id, &payload)
        .map(|envelope| envelope.with_trace_id(trace_id))
        .map_err(|e| {
            error!(order_id = %created.order_id, error = %e, "Failed to build OrderCreated");
            ApiError::Internal
        })?;

    state.producer.publish_envelope(&envelope).await.map_err(|e| {
        error!(order_id = %created.order_id, error = %e, "Failed to publish OrderCreated");
        ApiError::Internal
    })
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    let order_id = Uuid::parse_str(&id).map_err(|_| ApiError::BadRequest {
        reason: "INVALID_ID",
        message: format!("invalid order id: {id}"),
    })?;

    let cached = match state.cache.get(order_id).await {
        Ok(cached) => cached,
        Err(e) => {
            warn!(%order_id, error = %e, "Status cache read failed");
            None
        }
    };

    let status = match cached {
        Some(status) => status,
        None => {
            let status = state.ledger.order_status(order_id).await?;
            if let Err(e) = state.cache.put(order_id, &status).await {
                warn!(%order_id, error = %e, "Failed to cache order status");
            }
            status
        }
    };

    Ok(Json(OrderStatusResponse {
        order_id,
        status: status.status,
        updated_at: status.updated_at,
    }))
}

pub async fn list_products(State(state): State<AppState>) -> Result<Json<Vec<Product>>, ApiError> {
    Ok(Json(state.ledger.list_products().await?))
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::InMemoryLedger;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use std::str::FromStr;
    use tower::ServiceExt;

    struct Fixture {
        broker: InMemoryBroker,
        ledger: Arc<InMemoryLedger>,
        markers: Arc<InMemoryMarkerStore>,
        cache: Arc<InMemoryStatusCache>,
        producer: Arc<Producer>,
        router: Router,
    }

    fn product(sku: &str, price: &str) -> Product {
        Product {
            id: Uuid::new_v4(),
            sku: sku.to_string(),
            name: sku.to_lowercase(),
            stock: 10,
            price: BigDecimal::from_str(price).unwrap(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    impl Fixture {
        fn new(ledger: InMemoryLedger) -> Self {
            let broker = InMemoryBroker::new();
            let ledger = Arc::new(ledger);
            let markers = Arc::new(InMemoryMarkerStore::new());
            let cache = Arc::new(InMemoryStatusCache::new());
            let producer = Arc::new(Producer::start(
                Arc::new(broker.clone()),
                TOPIC_ORDER_CREATED,
                16,
            ));
            let router = create_router(
                AppState {
                    ledger: ledger.clone(),
                    producer: producer.clone(),
                    markers: markers.clone(),
                    cache: cache.clone(),
                    service_name: "order-svc".to_string(),
                },
                Duration::from_secs(5),
            );
            Self {
                broker,
                ledger,
                markers,
                cache,
                producer,
                router,
            }
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let json = if body.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
            };
            (status, json)
        }

        async fn post(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
            let request = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("content-type", "application/json")
                .header(REQUEST_ID_HEADER, "req-7")
                .body(Body::from(body.to_string()))
                .unwrap();
            self.send(request).await
        }

        async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            self.send(request).await
        }

        async fn published(&self) -> Vec<Envelope> {
            self.producer.close();
            self.producer.wait_closed().await;
            self.broker
                .messages(TOPIC_ORDER_CREATED)
                .iter()
                .map(|m| Envelope::from_bytes(&m.payload).unwrap())
                .collect()
        }
    }

    #[tokio::test]
    async fn create_order_prices_from_catalog_and_publishes() {
        let keyboard = product("SKU-KEYBOARD", "49.90");
        let cable = product("SKU-CABLE", "5.00");
        let fixture = Fixture::new(InMemoryLedger::new(vec![keyboard.clone(), cable.clone()]));

        let (status, body) = fixture
            .post(
                "/orders",
                serde_json::json!({
                    "external_id": "ext-1",
                    "user_id": "u-1",
                    "items": [
                        {"product_id": keyboard.id, "qty": 1},
                        {"product_id": cable.id, "qty": 3, "unit_price": "0.01"}
                    ]
                }),
            )
            .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["idempotent"], false);
        let order_id: Uuid = serde_json::from_value(body["order_id"].clone()).unwrap();
        let total: BigDecimal = serde_json::from_value(body["total_amount"].clone()).unwrap();
        assert_eq!(total, BigDecimal::from_str("64.90").unwrap());

        let events = fixture.published().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::OrderCreated);
        assert_eq!(events[0].correlation_id, order_id);
        assert_eq!(events[0].producer, "order-svc");
        assert_eq!(events[0].trace_id.as_deref(), Some("req-7"));

        let messages = fixture.broker.messages(TOPIC_ORDER_CREATED);
        assert_eq!(messages[0].key_str(), Some(order_id.to_string().as_str()));

        let marker = fixture.markers.value(&MarkerKey::order_create("ext-1"));
        assert_eq!(marker, Some(order_id.to_string()));
        let cached = fixture.cache.get(order_id).await.unwrap().unwrap();
        assert_eq!(cached.status, OrderStatus::Created);
    }

    #[tokio::test]
    async fn replayed_external_id_returns_original_order_once() {
        let mouse = product("SKU-MOUSE", "19.00");
        let fixture = Fixture::new(InMemoryLedger::new(vec![mouse.clone()]));

        let first = fixture
            .post(
                "/orders",
                serde_json::json!({
                    "external_id": "ext-dup",
                    "user_id": "u-1",
                    "items": [{"product_id": mouse.id, "qty": 1}]
                }),
            )
            .await;
        let second = fixture
            .post(
                "/orders",
                serde_json::json!({
                    "external_id": "ext-dup",
                    "user_id": "u-1",
                    "items": [{"product_id": mouse.id, "qty": 5}]
                }),
            )
            .await;

        assert_eq!(first.0, StatusCode::ACCEPTED);
        assert_eq!(second.0, StatusCode::ACCEPTED);
        assert_eq!(first.1["order_id"], second.1["order_id"]);
        assert_eq!(first.1["total_amount"], second.1["total_amount"]);
        assert_eq!(second.1["idempotent"], true);
        assert_eq!(fixture.published().await.len(), 1);
    }

    #[tokio::test]
    async fn create_order_by_sku() {
        let monitor = product("SKU-MONITOR", "150.00");
        let fixture = Fixture::new(InMemoryLedger::new(vec![monitor.clone()]));

        let (status, body) = fixture
            .post(
                "/orders/sku",
                serde_json::json!({
                    "external_id": "ext-sku",
                    "user_id": "u-2",
                    "items": [{"sku": "SKU-MONITOR", "qty": 2}]
                }),
            )
            .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        let events = fixture.published().await;
        match events[0].decode().unwrap() {
            DomainEvent::OrderCreated(created) => {
                assert_eq!(created.items[0].product_id, monitor.id);
                assert_eq!(created.total_amount, BigDecimal::from_str("300.00").unwrap());
                assert_eq!(created.order_id.to_string(), body["order_id"].as_str().unwrap());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn domain_errors_map_to_reason_codes() {
        let cable = product("SKU-CABLE", "5.00");
        let fixture = Fixture::new(InMemoryLedger::new(vec![cable.clone()]));

        let cases = [
            (
                serde_json::json!({"external_id": "e1", "user_id": "u", "items": [{"sku": "NOPE", "qty": 1}]}),
                "UNKNOWN_PRODUCT",
            ),
            (
                serde_json::json!({"external_id": "e2", "user_id": "u", "items": [{"sku": "SKU-CABLE", "qty": 0}]}),
                "INVALID_QUANTITY",
            ),
            (
                serde_json::json!({"external_id": "e3", "user_id": "u", "items": []}),
                "EMPTY_ORDER",
            ),
            (
                serde_json::json!({"external_id": "", "user_id": "u", "items": [{"sku": "SKU-CABLE", "qty": 1}]}),
                "MISSING_FIELDS",
            ),
            (
                serde_json::json!({"user_id": "u", "items": []}),
                "MISSING_FIELDS",
            ),
        ];
        for (body, reason) in cases {
            let (status, json) = fixture.post("/orders/sku", body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{reason}");
            assert_eq!(json["reason"], reason);
        }
        assert!(fixture.published().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let fixture = Fixture::new(InMemoryLedger::new(Vec::new()));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/orders")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let (status, json) = fixture.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["reason"], "INVALID_JSON");
    }

    #[tokio::test]
    async fn infrastructure_errors_hide_details() {
        let fixture = Fixture::new(InMemoryLedger::failing());

        let (status, json) = fixture
            .post(
                "/orders",
                serde_json::json!({
                    "external_id": "ext-x",
                    "user_id": "u",
                    "items": [{"product_id": Uuid::new_v4(), "qty": 1}]
                }),
            )
            .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json, serde_json::json!({"error": "internal error"}));
    }

    #[tokio::test]
    async fn order_status_prefers_cache_then_ledger() {
        let fixture = Fixture::new(InMemoryLedger::new(Vec::new()));
        let order_id = Uuid::new_v4();
        fixture.ledger.set_status(order_id, OrderStatus::StockReserved);

        let (status, json) = fixture.get(&format!("/orders/{order_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "STOCK_RESERVED");

        // A newer value in the cache wins until it expires.
        fixture
            .cache
            .put(order_id, &CachedStatus::now(OrderStatus::Failed))
            .await
            .unwrap();
        let (_, json) = fixture.get(&format!("/orders/{order_id}")).await;
        assert_eq!(json["status"], "FAILED");
    }

    #[tokio::test]
    async fn order_status_errors() {
        let fixture = Fixture::new(InMemoryLedger::new(Vec::new()));

        let (status, json) = fixture.get("/orders/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["reason"], "INVALID_ID");

        let (status, json) = fixture.get(&format!("/orders/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["reason"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn products_and_health() {
        let fixture = Fixture::new(InMemoryLedger::new(vec![
            product("SKU-MOUSE", "19.00"),
            product("SKU-CABLE", "5.00"),
        ]));

        let (status, json) = fixture.get("/products").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["sku"], "SKU-CABLE");
        assert_eq!(json[1]["sku"], "SKU-MOUSE");

        let (status, _) = fixture.get("/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }
}
