use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::StoreError;
use crate::status::OrderStatus;

pub const STATUS_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedStatus {
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

impl CachedStatus {
    pub fn now(status: OrderStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
        }
    }
}

pub fn status_key(order_id: Uuid) -> String {
    format!("order_status:{order_id}")
}

/// Short-TTL read cache in front of the orders table. May lag by at most the TTL
/// and is overwritten on every status transition.
#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn get(&self, order_id: Uuid) -> Result<Option<CachedStatus>, StoreError>;
    async fn put(&self, order_id: Uuid, status: &CachedStatus) -> Result<(), StoreError>;
}

pub async fn connect_redis(url: &str) -> Result<ConnectionManager, StoreError> {
    let client = redis::Client::open(url)?;
    Ok(ConnectionManager::new(client).await?)
}

#[derive(Clone)]
pub struct RedisStatusCache {
    conn: ConnectionManager,
}

impl RedisStatusCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn get(&self, order_id: Uuid) -> Result<Option<CachedStatus>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(status_key(order_id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, order_id: Uuid, status: &CachedStatus) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(status)?;
        let _: () = redis::cmd("SET")
            .arg(status_key(order_id))
            .arg(value)
            .arg("EX")
            .arg(STATUS_CACHE_TTL.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryStatusCache {
    entries: Mutex<HashMap<Uuid, (CachedStatus, Instant)>>,
}

impl InMemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusCache for InMemoryStatusCache {
    async fn get(&self, order_id: Uuid) -> Result<Option<CachedStatus>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(&order_id)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(status, _)| status.clone()))
    }

    async fn put(&self, order_id: Uuid, status: &CachedStatus) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(order_id, (status.clone(), Instant::now() + STATUS_CACHE_TTL));
        Ok(())
    }
}
