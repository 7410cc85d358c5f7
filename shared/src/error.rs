use thiserror::Error;

use crate::events::EventType;

/// Errors raised by the broker plumbing (producer, consumer, readers and writers).
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to configure kafka client: {0}")]
    Config(String),

    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("failed to receive message: {0}")]
    Receive(String),

    #[error("failed to commit offset {offset} on {topic}/{partition}: {reason}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("producer for {0} is closed")]
    ProducerClosed(String),

    #[error("consumer worker {0} stopped unexpectedly")]
    WorkerStopped(usize),

    #[error("handler reported a fatal error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Errors encoding or decoding the event envelope and its payloads.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("payload of {event_type} v{version} does not decode: {source}")]
    Payload {
        event_type: EventType,
        version: u32,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Errors from the cache store (dedup markers and the status cache).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
