use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BusError;

pub type Header = (String, Vec<u8>);

/// A message as delivered by a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<Header>,
}

impl Message {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }
}

/// A message accepted by a producer and waiting to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<Header>,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(key: Option<Vec<u8>>, value: Vec<u8>, headers: Vec<Header>) -> Self {
        Self {
            key,
            value,
            headers,
            enqueued_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait MessageWriter: Send + Sync {
    async fn write(&self, topic: &str, message: &OutboundMessage) -> Result<(), BusError>;

    /// Blocks until everything written so far has reached the broker.
    async fn flush(&self) -> Result<(), BusError>;
}

#[async_trait]
pub trait MessageReader: Send + Sync {
    /// Next message, or `None` once the stream has ended.
    async fn read(&self) -> Result<Option<Message>, BusError>;

    /// Stores `next_offset` as the position the group resumes from on `topic`/`partition`.
    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BusError>;
}
