//! Protocol and plumbing shared by the order and inventory services.
//!
//! - [`events`] / [`topics`]: the versioned envelope and the topic surface
//! - [`status`]: the order status state machine
//! - [`dedup`] / [`cache`]: Redis-backed idempotency markers and the status cache
//! - [`broker`], [`producer`], [`consumer`]: the message dispatch engine
//! - [`db`]: Postgres pool and embedded migrations

pub mod broker;
pub mod cache;
pub mod consumer;
pub mod db;
pub mod dedup;
pub mod error;
pub mod events;
pub mod kafka;
pub mod memory;
pub mod producer;
pub mod shutdown;
pub mod status;
pub mod topics;

pub use broker::{Header, Message, MessageReader, MessageWriter, OutboundMessage};
pub use cache::{connect_redis, CachedStatus, InMemoryStatusCache, RedisStatusCache, StatusCache};
pub use consumer::{Consumer, HandlerError, MessageHandler};
pub use db::DbPool;
pub use dedup::{already_seen, remember, InMemoryMarkerStore, MarkerKey, MarkerStore, RedisMarkerStore};
pub use error::{BusError, EnvelopeError, StoreError};
pub use events::*;
pub use kafka::{KafkaReader, KafkaWriter};
pub use memory::{InMemoryBroker, InMemoryReader};
pub use producer::Producer;
pub use shutdown::{shutdown_channel, wait_for_signal, Shutdown, ShutdownTrigger};
pub use status::{can_transition, OrderStatus};
pub use topics::*;
