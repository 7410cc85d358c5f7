use anyhow::anyhow;
use async_trait::async_trait;
use shared::*;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::reservation::{merge_lines, ReservationError, ReservationStore, ReserveOutcome, Transition};

pub const DEDUP_SCOPE: &str = "inventory";

pub struct InventoryService {
    store: Arc<dyn ReservationStore>,
    markers: Arc<dyn MarkerStore>,
    cache: Arc<dyn StatusCache>,
    reserved: Arc<Producer>,
    rejected: Arc<Producer>,
    service_name: String,
}

impl InventoryService {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        markers: Arc<dyn MarkerStore>,
        cache: Arc<dyn StatusCache>,
        reserved: Arc<Producer>,
        rejected: Arc<Producer>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            markers,
            cache,
            reserved,
            rejected,
            service_name: service_name.into(),
        }
    }

    async fn handle_order_created(
        &self,
        envelope: &Envelope,
        event: OrderCreated,
    ) -> Result<(), HandlerError> {
        let order_id = event.order_id;
        let items: Vec<ItemQty> = event.items.iter().map(ItemQty::from).collect();
        if items.is_empty() {
            return Err(HandlerError::permanent(anyhow!(
                "order {order_id} was created without items"
            )));
        }
        if let Err(e) = merge_lines(&items) {
            warn!(%order_id, error = %e, "Invalid order lines, rejecting order");
            self.advance(order_id, OrderStatus::Failed).await?;
            return self
                .publish_rejected(envelope, order_id, REASON_INVALID_QUANTITY, Vec::new())
                .await;
        }

        let outcome = self
            .store
            .reserve_all(order_id, &items)
            .await
            .map_err(reservation_failed)?;

        match outcome {
            ReserveOutcome::AlreadyReserved => {
                info!(%order_id, "Stock already reserved, publishing StockReserved again");
                self.advance(order_id, OrderStatus::StockReserved).await?;
                self.publish_reserved(envelope, order_id, items).await
            }
            ReserveOutcome::Reserved => {
                if let Transition::Illegal { from } =
                    self.advance(order_id, OrderStatus::StockReserved).await?
                {
                    warn!(%order_id, %from, "Order moved on before stock was reserved, releasing");
                    self.store
                        .release_all(order_id)
                        .await
                        .map_err(HandlerError::retryable)?;
                    return Ok(());
                }
                info!(%order_id, items = items.len(), "Stock reserved");
                self.publish_reserved(envelope, order_id, items).await
            }
            ReserveOutcome::Rejected(shortfalls) => {
                info!(%order_id, shortfalls = shortfalls.len(), "Insufficient stock, rejecting order");
                self.advance(order_id, OrderStatus::Failed).await?;
                self.publish_rejected(envelope, order_id, REASON_OUT_OF_STOCK, shortfalls)
                    .await
            }
        }
    }

    async fn handle_payment_failed(&self, event: PaymentFailed) -> Result<(), HandlerError> {
        let order_id = event.order_id;
        let released = self
            .store
            .release_all(order_id)
            .await
            .map_err(HandlerError::retryable)?;
        info!(%order_id, released = released.len(), reason = %event.reason, "Payment failed, stock released");

        self.advance(order_id, OrderStatus::Failed).await?;
        Ok(())
    }

    async fn advance(&self, order_id: Uuid, to: OrderStatus) -> Result<Transition, HandlerError> {
        let transition = self
            .store
            .transition_status(order_id, to)
            .await
            .map_err(HandlerError::retryable)?;

        match transition {
            Transition::Applied { from } => {
                info!(%order_id, %from, %to, "Order status updated");
                if let Err(e) = self.cache.put(order_id, &CachedStatus::now(to)).await {
                    warn!(%order_id, error = %e, "Failed to refresh status cache");
                }
            }
            Transition::Unchanged => debug!(%order_id, status = %to, "Order status unchanged"),
            Transition::Illegal { from } => {
                warn!(%order_id, %from, %to, "Illegal status transition skipped")
            }
            Transition::NotFound => warn!(%order_id, "Order not found for status update"),
        }
        Ok(transition)
    }

    async fn publish_reserved(
        &self,
        cause: &Envelope,
        order_id: Uuid,
        items: Vec<ItemQty>,
    ) -> Result<(), HandlerError> {
        let envelope = Envelope::new(&self.service_name, order_id, &StockReserved { order_id, items })
            .map_err(HandlerError::fatal)?
            .with_trace_id(cause.trace_id.clone());
        self.reserved
            .publish_envelope(&envelope)
            .await
            .map_err(publish_failed)
    }

    async fn publish_rejected(
        &self,
        cause: &Envelope,
        order_id: Uuid,
        reason: &str,
        details: Vec<Shortfall>,
    ) -> Result<(), HandlerError> {
        let rejected = StockRejected {
            order_id,
            reason: reason.to_string(),
            details,
        };
        let envelope = Envelope::new(&self.service_name, order_id, &rejected)
            .map_err(HandlerError::fatal)?
            .with_trace_id(cause.trace_id.clone());
        self.rejected
            .publish_envelope(&envelope)
            .await
            .map_err(publish_failed)
    }
}

fn reservation_failed(e: ReservationError) -> HandlerError {
    match e {
        ReservationError::InvalidLine(_) => HandlerError::permanent(e),
        other => HandlerError::retryable(other),
    }
}

fn publish_failed(e: BusError) -> HandlerError {
    match e {
        BusError::Envelope(e) => HandlerError::fatal(e),
        other => HandlerError::retryable(other),
    }
}

#[async_trait]
impl MessageHandler for InventoryService {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let envelope = Envelope::from_bytes(&message.payload).map_err(HandlerError::permanent)?;
        let event = envelope.decode().map_err(HandlerError::permanent)?;

        let marker = MarkerKey::event(DEDUP_SCOPE, envelope.event_id);
        if matches!(
            event,
            DomainEvent::OrderCreated(_) | DomainEvent::PaymentFailed(_)
        ) && already_seen(self.markers.as_ref(), &marker).await
        {
            info!(event_id = %envelope.event_id, "Duplicate event, skipping");
            return Ok(());
        }

        let result = match event {
            DomainEvent::OrderCreated(event) => self.handle_order_created(&envelope, event).await,
            DomainEvent::PaymentFailed(event) => self.handle_payment_failed(event).await,
            DomainEvent::Unsupported {
                event_type,
                version,
            } => {
                debug!(%event_type, version, topic = %message.topic, "Ignoring unsupported event");
                return Ok(());
            }
            other => {
                debug!(event = ?other, "Ignoring event not handled by inventory");
                return Ok(());
            }
        };

        // Marked only once the side effects are done; any failure leaves it unset.
        if result.is_ok() {
            remember(self.markers.as_ref(), &marker, "1").await;
        }
        result
    }
}
