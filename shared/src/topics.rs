use crate::events::EventType;

pub const TOPIC_ORDER_CREATED: &str = "order.created";
pub const TOPIC_STOCK_RESERVED: &str = "order.stock.reserved";
pub const TOPIC_STOCK_REJECTED: &str = "order.stock.rejected";
pub const TOPIC_PAYMENT_AUTHORIZED: &str = "order.payment.authorized";
pub const TOPIC_PAYMENT_FAILED: &str = "order.payment.failed";
pub const TOPIC_ORDER_FINALIZED: &str = "order.finalized";

pub const HEADER_EVENT_TYPE: &str = "x-event-type";
pub const HEADER_EVENT_VERSION: &str = "x-event-version";

/// Topic an event type is published to.
pub fn topic_for(event_type: EventType) -> Option<&'static str> {
    match event_type {
        EventType::OrderCreated => Some(TOPIC_ORDER_CREATED),
        EventType::StockReserved => Some(TOPIC_STOCK_RESERVED),
        EventType::StockRejected => Some(TOPIC_STOCK_REJECTED),
        EventType::PaymentAuthorized => Some(TOPIC_PAYMENT_AUTHORIZED),
        EventType::PaymentFailed => Some(TOPIC_PAYMENT_FAILED),
        EventType::OrderFinalized => Some(TOPIC_ORDER_FINALIZED),
        EventType::Unknown => None,
    }
}
