//! In-process broker used by tests and local runs.
//!
//! Each topic is a single append-only partition. Committed offsets are kept per
//! `(group, topic)` and a new reader starts from them, so anything a previous
//! reader left uncommitted is delivered again.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::broker::{Message, MessageReader, MessageWriter, OutboundMessage};
use crate::error::BusError;

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<Message>>,
    committed: HashMap<(String, String), i64>,
    closed: bool,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    appended: Arc<watch::Sender<u64>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            appended: Arc::new(appended),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.appended.send_modify(|n| *n += 1);
    }

    /// Appends directly to a topic, bypassing any producer.
    pub fn append(&self, topic: &str, message: &OutboundMessage) -> i64 {
        let offset = {
            let mut state = self.state();
            let log = state.logs.entry(topic.to_string()).or_default();
            let offset = log.len() as i64;
            log.push(Message {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: message.key.clone(),
                payload: message.value.clone(),
                headers: message.headers.clone(),
            });
            offset
        };
        self.bump();
        offset
    }

    /// Readers return `None` once they have drained every topic.
    pub fn close(&self) {
        self.state().closed = true;
        self.bump();
    }

    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.state().logs.get(topic).cloned().unwrap_or_default()
    }

    pub fn committed(&self, group: &str, topic: &str) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    pub fn reader(&self, group: &str, topics: &[&str]) -> InMemoryReader {
        let positions = {
            let state = self.state();
            topics
                .iter()
                .map(|topic| {
                    let start = state
                        .committed
                        .get(&(group.to_string(), topic.to_string()))
                        .copied()
                        .unwrap_or(0);
                    (topic.to_string(), start)
                })
                .collect()
        };

        InMemoryReader {
            broker: self.clone(),
            group: group.to_string(),
            positions: Mutex::new(positions),
        }
    }
}

#[async_trait]
impl MessageWriter for InMemoryBroker {
    async fn write(&self, topic: &str, message: &OutboundMessage) -> Result<(), BusError> {
        self.append(topic, message);
        Ok(())
    }

    async fn flush(&self) -> Result<(), BusError> {
        Ok(())
    }
}

pub struct InMemoryReader {
    broker: InMemoryBroker,
    group: String,
    positions: Mutex<Vec<(String, i64)>>,
}

impl InMemoryReader {
    fn poll(&self) -> Option<Message> {
        let state = self.broker.state();
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        for (topic, position) in positions.iter_mut() {
            let next = state
                .logs
                .get(topic.as_str())
                .and_then(|log| log.get(*position as usize));
            if let Some(message) = next {
                *position += 1;
                return Some(message.clone());
            }
        }
        None
    }
}

#[async_trait]
impl MessageReader for InMemoryReader {
    async fn read(&self) -> Result<Option<Message>, BusError> {
        let mut appended = self.broker.appended.subscribe();
        loop {
            if let Some(message) = self.poll() {
                return Ok(Some(message));
            }
            if self.broker.state().closed {
                return Ok(None);
            }
            if appended.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&self, topic: &str, _partition: i32, next_offset: i64) -> Result<(), BusError> {
        let mut state = self.broker.state();
        let committed = state
            .committed
            .entry((self.group.clone(), topic.to_string()))
            .or_insert(0);
        *committed = (*committed).max(next_offset);
        Ok(())
    }
}
