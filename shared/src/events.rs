//! Versioned event envelope and the payload schemas carried inside it.
//!
//! Every domain fact leaves a service wrapped in an [`Envelope`]. The payload is
//! kept as opaque JSON until a consumer asks for it through [`Envelope::decode`],
//! which picks the schema from `(event_type, event_version)` and never by looking
//! at the shape of the payload.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::EnvelopeError;
use crate::status::OrderStatus;

/// Version written by this code base for every payload schema.
pub const CURRENT_EVENT_VERSION: u32 = 1;

/// Reason attached to [`StockRejected`] when stock is short.
pub const REASON_OUT_OF_STOCK: &str = "OUT_OF_STOCK";
pub const REASON_INVALID_QUANTITY: &str = "INVALID_QUANTITY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    OrderCreated,
    StockReserved,
    StockRejected,
    PaymentAuthorized,
    PaymentFailed,
    OrderFinalized,
    /// Any type this build does not know about. Consumers skip these.
    #[serde(other)]
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "OrderCreated",
            EventType::StockReserved => "StockReserved",
            EventType::StockRejected => "StockRejected",
            EventType::PaymentAuthorized => "PaymentAuthorized",
            EventType::PaymentFailed => "PaymentFailed",
            EventType::OrderFinalized => "OrderFinalized",
            EventType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every payload schema so the envelope can stamp type and version.
pub trait EventPayload: Serialize + DeserializeOwned {
    const EVENT_TYPE: EventType;
    const EVENT_VERSION: u32 = CURRENT_EVENT_VERSION;
}

/// Immutable wrapper around a domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub producer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// The order id. Groups every event of one order lifecycle and is the ordering key.
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wraps `payload` in a fresh envelope with a new event id.
    pub fn new<P: EventPayload>(
        producer: impl Into<String>,
        order_id: Uuid,
        payload: &P,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: P::EVENT_TYPE,
            event_version: P::EVENT_VERSION,
            occurred_at: Utc::now(),
            producer: producer.into(),
            trace_id: None,
            correlation_id: order_id,
            payload: serde_json::to_value(payload).map_err(EnvelopeError::Encode)?,
        })
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id.filter(|t| !t.is_empty());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)
    }

    /// Selects the payload schema by `(event_type, event_version)`.
    ///
    /// Unknown types and versions come back as [`DomainEvent::Unsupported`] so a
    /// consumer can acknowledge and skip them during a rolling upgrade.
    pub fn decode(&self) -> Result<DomainEvent, EnvelopeError> {
        let event = match (self.event_type, self.event_version) {
            (EventType::OrderCreated, 1) => DomainEvent::OrderCreated(self.payload()?),
            (EventType::StockReserved, 1) => DomainEvent::StockReserved(self.payload()?),
            (EventType::StockRejected, 1) => DomainEvent::StockRejected(self.payload()?),
            (EventType::PaymentAuthorized, 1) => DomainEvent::PaymentAuthorized(self.payload()?),
            (EventType::PaymentFailed, 1) => DomainEvent::PaymentFailed(self.payload()?),
            (EventType::OrderFinalized, 1) => DomainEvent::OrderFinalized(self.payload()?),
            (event_type, version) => DomainEvent::Unsupported {
                event_type,
                version,
            },
        };
        Ok(event)
    }

    fn payload<P: EventPayload>(&self) -> Result<P, EnvelopeError> {
        P::deserialize(&self.payload).map_err(|source| EnvelopeError::Payload {
            event_type: self.event_type,
            version: self.event_version,
            source,
        })
    }
}

/// Decoded payload, one variant per known `(event_type, version)`.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    OrderCreated(OrderCreated),
    StockReserved(StockReserved),
    StockRejected(StockRejected),
    PaymentAuthorized(PaymentAuthorized),
    PaymentFailed(PaymentFailed),
    OrderFinalized(OrderFinalized),
    Unsupported { event_type: EventType, version: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQty {
    pub product_id: Uuid,
    pub qty: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: Uuid,
    pub qty: i32,
    pub unit_price: BigDecimal,
}

impl From<&LineItem> for ItemQty {
    fn from(line: &LineItem) -> Self {
        Self {
            product_id: line.product_id,
            qty: line.qty,
        }
    }
}

/// Requested quantity exceeded what was on the shelf when the row was locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub product_id: Uuid,
    pub required: i32,
    pub available: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub external_id: String,
    pub user_id: String,
    pub items: Vec<LineItem>,
    pub total_amount: BigDecimal,
}

impl EventPayload for OrderCreated {
    const EVENT_TYPE: EventType = EventType::OrderCreated;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub order_id: Uuid,
    pub items: Vec<ItemQty>,
}

impl EventPayload for StockReserved {
    const EVENT_TYPE: EventType = EventType::StockReserved;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRejected {
    pub order_id: Uuid,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<Shortfall>,
}

impl EventPayload for StockRejected {
    const EVENT_TYPE: EventType = EventType::StockRejected;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAuthorized {
    pub order_id: Uuid,
    pub payment_ref: String,
    pub amount: BigDecimal,
}

impl EventPayload for PaymentAuthorized {
    const EVENT_TYPE: EventType = EventType::PaymentAuthorized;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub order_id: Uuid,
    pub reason: String,
}

impl EventPayload for PaymentFailed {
    const EVENT_TYPE: EventType = EventType::PaymentFailed;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFinalized {
    pub order_id: Uuid,
    pub final_status: OrderStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

impl EventPayload for OrderFinalized {
    const EVENT_TYPE: EventType = EventType::OrderFinalized;
}
