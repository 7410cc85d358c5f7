//! TTL-keyed markers for request idempotency and consumer-side event dedup.
//!
//! Markers only speed things up. The relational store stays authoritative, so a
//! store failure is treated as "not seen before" and the work is simply redone.
//! Consumers write an event marker only after the event's side effects completed.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;

pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEDUP_TTL: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MarkerKey {
    /// `idem:order:create:{external_id}`
    OrderCreate { external_id: String },
    /// `dedup:{scope}:{event_id}`
    Event { scope: String, event_id: Uuid },
}

impl MarkerKey {
    pub fn order_create(external_id: impl Into<String>) -> Self {
        MarkerKey::OrderCreate {
            external_id: external_id.into(),
        }
    }

    pub fn event(scope: impl Into<String>, event_id: Uuid) -> Self {
        MarkerKey::Event {
            scope: scope.into(),
            event_id,
        }
    }

    pub fn redis_key(&self) -> String {
        match self {
            MarkerKey::OrderCreate { external_id } => format!("idem:order:create:{external_id}"),
            MarkerKey::Event { scope, event_id } => format!("dedup:{scope}:{event_id}"),
        }
    }

    pub fn ttl(&self) -> Duration {
        match self {
            MarkerKey::OrderCreate { .. } => IDEMPOTENCY_TTL,
            MarkerKey::Event { .. } => DEDUP_TTL,
        }
    }
}

#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Atomically records the marker. `true` if it was newly created.
    async fn mark_if_absent(&self, key: &MarkerKey, value: &str) -> Result<bool, StoreError>;

    async fn contains(&self, key: &MarkerKey) -> Result<bool, StoreError>;

    async fn clear(&self, key: &MarkerKey) -> Result<(), StoreError>;
}

/// Best-effort `contains`: a store error counts as not seen.
pub async fn already_seen(store: &dyn MarkerStore, key: &MarkerKey) -> bool {
    match store.contains(key).await {
        Ok(seen) => seen,
        Err(e) => {
            warn!(key = %key.redis_key(), error = %e, "Marker store unavailable, assuming first sighting");
            false
        }
    }
}

/// Best-effort `mark_if_absent`. An existing marker is left as it is.
pub async fn remember(store: &dyn MarkerStore, key: &MarkerKey, value: &str) {
    if let Err(e) = store.mark_if_absent(key, value).await {
        warn!(key = %key.redis_key(), error = %e, "Failed to set marker");
    }
}

#[derive(Clone)]
pub struct RedisMarkerStore {
    conn: ConnectionManager,
}

impl RedisMarkerStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl MarkerStore for RedisMarkerStore {
    async fn mark_if_absent(&self, key: &MarkerKey, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key.redis_key())
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(key.ttl().as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn contains(&self, key: &MarkerKey) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("EXISTS")
            .arg(key.redis_key())
            .query_async(&mut conn)
            .await?;
        Ok(found > 0)
    }

    async fn clear(&self, key: &MarkerKey) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _removed: i64 = redis::cmd("DEL")
            .arg(key.redis_key())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Marker store with the same expiry semantics as Redis, kept in process memory.
#[derive(Default)]
pub struct InMemoryMarkerStore {
    markers: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, key: &MarkerKey) -> Option<String> {
        let markers = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        markers
            .get(&key.redis_key())
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone())
    }
}

#[async_trait]
impl MarkerStore for InMemoryMarkerStore {
    async fn mark_if_absent(&self, key: &MarkerKey, value: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut markers = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        match markers.get(&key.redis_key()) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                markers.insert(key.redis_key(), (value.to_string(), now + key.ttl()));
                Ok(true)
            }
        }
    }

    async fn contains(&self, key: &MarkerKey) -> Result<bool, StoreError> {
        Ok(self.value(key).is_some())
    }

    async fn clear(&self, key: &MarkerKey) -> Result<(), StoreError> {
        self.markers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key.redis_key());
        Ok(())
    }
}
