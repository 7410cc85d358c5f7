use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header as KafkaHeader, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::{Message as _, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::info;

use crate::broker::{Message, MessageReader, MessageWriter, OutboundMessage};
use crate::error::BusError;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct KafkaWriter {
    producer: FutureProducer,
}

impl KafkaWriter {
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BusError::Config(e.to_string()))?;

        Ok(Self { producer })
    }
}

#[async_trait]
impl MessageWriter for KafkaWriter {
    async fn write(&self, topic: &str, message: &OutboundMessage) -> Result<(), BusError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(KafkaHeader {
                key,
                value: Some(value),
            });
        }

        let mut record = FutureRecord::<Vec<u8>, Vec<u8>>::to(topic)
            .payload(&message.value)
            .headers(headers)
            .timestamp(message.enqueued_at.timestamp_millis());
        if let Some(key) = &message.key {
            record = record.key(key);
        }

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn flush(&self) -> Result<(), BusError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT))
            .await
            .map_err(|e| BusError::Publish {
                topic: "*".to_string(),
                reason: e.to_string(),
            })?
            .map_err(|e| BusError::Publish {
                topic: "*".to_string(),
                reason: e.to_string(),
            })
    }
}

pub struct KafkaReader {
    consumer: StreamConsumer,
}

impl KafkaReader {
    pub fn new(brokers: &str, group_id: &str, topics: &[&str]) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BusError::Config(e.to_string()))?;

        consumer
            .subscribe(topics)
            .map_err(|e| BusError::Config(e.to_string()))?;

        info!(?topics, group_id, manual_commit = true, "Subscribed to topics");

        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageReader for KafkaReader {
    async fn read(&self) -> Result<Option<Message>, BusError> {
        let borrowed = self
            .consumer
            .recv()
            .await
            .map_err(|e| BusError::Receive(e.to_string()))?;

        let headers = borrowed
            .headers()
            .map(|hs| {
                hs.iter()
                    .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec).unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(Message {
            topic: borrowed.topic().to_string(),
            partition: borrowed.partition(),
            offset: borrowed.offset(),
            key: borrowed.key().map(<[u8]>::to_vec),
            payload: borrowed.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
        }))
    }

    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BusError> {
        let commit_error = |reason: String| BusError::Commit {
            topic: topic.to_string(),
            partition,
            offset: next_offset,
            reason,
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(|e| commit_error(e.to_string()))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| commit_error(e.to_string()))
    }
}
