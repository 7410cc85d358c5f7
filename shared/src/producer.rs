use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::broker::{Header, MessageWriter, OutboundMessage};
use crate::error::BusError;
use crate::events::Envelope;
use crate::topics::{HEADER_EVENT_TYPE, HEADER_EVENT_VERSION};

pub const DEFAULT_BUFFER: usize = 1024;

/// Asynchronous publisher for a single topic.
///
/// `publish` only waits for room in the bounded queue; a background task writes to
/// the broker. `close` stops intake and `wait_closed` resolves once every accepted
/// message has been handed to the writer and the writer has been flushed.
pub struct Producer {
    topic: String,
    sender: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
    drained: watch::Receiver<bool>,
}

impl Producer {
    pub fn start(writer: Arc<dyn MessageWriter>, topic: impl Into<String>, buffer: usize) -> Self {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (drained_tx, drained_rx) = watch::channel(false);

        tokio::spawn(drain(writer, topic.clone(), rx, drained_tx));

        Self {
            topic,
            sender: Mutex::new(Some(tx)),
            drained: drained_rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(
        &self,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        headers: Vec<Header>,
    ) -> Result<(), BusError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BusError::ProducerClosed(self.topic.clone()))?;

        sender
            .send(OutboundMessage::new(key, value, headers))
            .await
            .map_err(|_| BusError::ProducerClosed(self.topic.clone()))
    }

    /// Publishes an envelope keyed by its correlation id (the order id).
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<(), BusError> {
        let value = envelope.to_bytes()?;
        let headers = vec![
            (
                HEADER_EVENT_TYPE.to_string(),
                envelope.event_type.as_str().as_bytes().to_vec(),
            ),
            (
                HEADER_EVENT_VERSION.to_string(),
                envelope.event_version.to_string().into_bytes(),
            ),
        ];
        let key = envelope.correlation_id.to_string().into_bytes();

        self.publish(Some(key), value, headers).await?;
        debug!(
            topic = %self.topic,
            event_id = %envelope.event_id,
            order_id = %envelope.correlation_id,
            event_type = %envelope.event_type,
            "Event enqueued"
        );
        Ok(())
    }

    /// Stops accepting messages. Already accepted messages are still written.
    pub fn close(&self) {
        if self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!(topic = %self.topic, "Producer closing");
        }
    }

    pub async fn wait_closed(&self) {
        let mut drained = self.drained.clone();
        // Err: the drain task is gone.
        let _ = drained.wait_for(|done| *done).await;
    }
}

async fn drain(
    writer: Arc<dyn MessageWriter>,
    topic: String,
    mut rx: mpsc::Receiver<OutboundMessage>,
    drained: watch::Sender<bool>,
) {
    let mut written = 0u64;
    let mut dropped = 0u64;

    while let Some(message) = rx.recv().await {
        match writer.write(&topic, &message).await {
            Ok(()) => written += 1,
            Err(e) => {
                dropped += 1;
                error!(
                    topic = %topic,
                    key = ?message.key.as_deref().map(String::from_utf8_lossy),
                    error = %e,
                    "Failed to write message, dropping it"
                );
            }
        }
    }

    if let Err(e) = writer.flush().await {
        warn!(topic = %topic, error = %e, "Failed to flush writer");
    }

    info!(topic = %topic, written, dropped, "Producer drained");
    drained.send_replace(true);
}
