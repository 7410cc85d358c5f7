//! Worker-pool consumer with commit-after-success.
//!
//! One dispatch loop reads from the broker and hands each message to a worker
//! chosen by its key, so every event of one order is handled by the same worker in
//! read order. Workers report back when a message is settled and the loop commits,
//! per partition, the lowest offset still outstanding. A message whose handler
//! failed stays outstanding, so the group's committed position never passes it and
//! it is delivered again after a restart or rebalance.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{Message, MessageReader};
use crate::error::BusError;
use crate::shutdown::Shutdown;

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_QUEUE_DEPTH: usize = 128;
pub const ERROR_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Leave the offset uncommitted so the message is delivered again.
    #[error("retryable: {0:#}")]
    Retryable(anyhow::Error),
    /// Redelivery cannot help. Logged and committed.
    #[error("permanent: {0:#}")]
    Permanent(anyhow::Error),
    /// Broken invariant inside this process. Stops the consumer.
    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),
}

impl HandlerError {
    pub fn retryable(e: impl Into<anyhow::Error>) -> Self {
        HandlerError::Retryable(e.into())
    }

    pub fn permanent(e: impl Into<anyhow::Error>) -> Self {
        HandlerError::Permanent(e.into())
    }

    pub fn fatal(e: impl Into<anyhow::Error>) -> Self {
        HandlerError::Fatal(e.into())
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

enum Outcome {
    Done,
    Held,
    Fatal(String),
}

struct Settled {
    topic: String,
    partition: i32,
    offset: i64,
    outcome: Outcome,
}

#[derive(Default)]
struct PartitionOffsets {
    outstanding: BTreeSet<i64>,
    highest_done: Option<i64>,
    committed: Option<i64>,
}

/// Commit positions for every partition the consumer has read from.
#[derive(Default)]
struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    fn track(&mut self, message: &Message) {
        self.partitions
            .entry((message.topic.clone(), message.partition))
            .or_default()
            .outstanding
            .insert(message.offset);
    }

    /// Marks `offset` done and returns the new commit position if it moved.
    fn done(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let p = self.partitions.get_mut(&(topic.to_string(), partition))?;
        p.outstanding.remove(&offset);
        p.highest_done = Some(p.highest_done.map_or(offset, |h| h.max(offset)));

        let next = match p.outstanding.first() {
            Some(lowest) => *lowest,
            None => p.highest_done? + 1,
        };
        if p.committed.map_or(true, |c| next > c) {
            p.committed = Some(next);
            Some(next)
        } else {
            None
        }
    }
}

pub struct Consumer {
    reader: Arc<dyn MessageReader>,
    workers: usize,
    queue_depth: usize,
    backoff: Duration,
}

impl Consumer {
    pub fn new(reader: Arc<dyn MessageReader>, workers: usize) -> Self {
        Self {
            reader,
            workers: workers.max(1),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            backoff: ERROR_BACKOFF,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs until `shutdown` fires, the stream ends, a read fails, or a handler
    /// reports a fatal error. Returns after every worker has finished its queue.
    pub async fn start(
        &self,
        mut shutdown: Shutdown,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<Settled>();
        let (errors_tx, mut errors_rx) = mpsc::channel::<String>(self.workers);

        let mut queues = Vec::with_capacity(self.workers);
        let mut handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let (tx, rx) = mpsc::channel(self.queue_depth);
            queues.push(tx);
            handles.push(tokio::spawn(work(
                id,
                rx,
                handler.clone(),
                settled_tx.clone(),
                errors_tx.clone(),
            )));
        }
        drop(errors_tx);

        info!(workers = self.workers, "Consumer started");

        let mut tracker = OffsetTracker::default();
        let mut round_robin = 0usize;

        let result: Result<(), BusError> = loop {
            if errors_rx.try_recv().is_ok() {
                let mut observed = 1;
                while errors_rx.try_recv().is_ok() {
                    observed += 1;
                }
                warn!(
                    observed,
                    backoff_ms = self.backoff.as_millis() as u64,
                    "Handler errors observed, backing off"
                );
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }

            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                Some(settled) = settled_rx.recv() => {
                    if let Err(e) = self.settle(&mut tracker, settled).await {
                        break Err(e);
                    }
                    continue;
                }
                read = self.reader.read() => match read {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        info!("Message stream ended");
                        break Ok(());
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read message, stopping consumer");
                        break Err(e);
                    }
                },
            };

            tracker.track(&message);
            let idx = match &message.key {
                Some(key) => worker_for(key, self.workers),
                None => {
                    round_robin = (round_robin + 1) % self.workers;
                    round_robin
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                sent = queues[idx].send(message) => {
                    if sent.is_err() {
                        break Err(BusError::WorkerStopped(idx));
                    }
                }
            }
        };

        info!("Consumer stopping, waiting for workers");
        drop(queues);
        for (id, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker = id, error = %e, "Worker task failed");
            }
        }

        drop(settled_tx);
        let mut result = result;
        while let Some(settled) = settled_rx.recv().await {
            if let Err(e) = self.settle(&mut tracker, settled).await {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        info!("Consumer stopped");
        result
    }

    async fn settle(&self, tracker: &mut OffsetTracker, settled: Settled) -> Result<(), BusError> {
        match settled.outcome {
            Outcome::Held => Ok(()),
            Outcome::Fatal(reason) => Err(BusError::Fatal(reason)),
            Outcome::Done => {
                let Some(next) = tracker.done(&settled.topic, settled.partition, settled.offset)
                else {
                    return Ok(());
                };
                if let Err(e) = self
                    .reader
                    .commit(&settled.topic, settled.partition, next)
                    .await
                {
                    warn!(error = %e, "Failed to commit offset, message may be redelivered");
                }
                Ok(())
            }
        }
    }
}

fn worker_for(key: &[u8], workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn work(
    id: usize,
    mut rx: mpsc::Receiver<Message>,
    handler: Arc<dyn MessageHandler>,
    settled: mpsc::UnboundedSender<Settled>,
    errors: mpsc::Sender<String>,
) {
    while let Some(message) = rx.recv().await {
        let outcome = match handler.handle(&message).await {
            Ok(()) => {
                debug!(worker = id, topic = %message.topic, offset = message.offset, "Message handled");
                Outcome::Done
            }
            Err(HandlerError::Permanent(e)) => {
                warn!(
                    worker = id,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %format!("{e:#}"),
                    "Dropping message that cannot be processed"
                );
                Outcome::Done
            }
            Err(HandlerError::Retryable(e)) => {
                let reason = format!("{e:#}");
                error!(
                    worker = id,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %reason,
                    "Handler failed, leaving offset uncommitted"
                );
                let _ = errors.try_send(reason);
                Outcome::Held
            }
            Err(HandlerError::Fatal(e)) => {
                let reason = format!("{e:#}");
                error!(worker = id, topic = %message.topic, offset = message.offset, error = %reason, "Fatal handler error");
                Outcome::Fatal(reason)
            }
        };

        let report = Settled {
            topic: message.topic,
            partition: message.partition,
            offset: message.offset,
            outcome,
        };
        if settled.send(report).is_err() {
            break;
        }
    }
    debug!(worker = id, "Worker finished");
}
