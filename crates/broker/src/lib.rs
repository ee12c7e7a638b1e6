//! The KV/stream broker — the only coordination surface shared between
//! workers.
//!
//! A thin capability layer over key-value storage with TTL, list append,
//! and pub/sub. The production implementation maps onto Redis; tests use
//! the in-memory implementation. Everything above this crate programs
//! against the [`Broker`] trait only.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

mod memory;
mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors from broker operations. All of them are transport-class: callers
/// either retry with backoff or fail the run.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection: {0}")]
    Connection(String),

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("broker subscription closed")]
    SubscriptionClosed,
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            BrokerError::Connection(e.to_string())
        } else {
            BrokerError::Command(e.to_string())
        }
    }
}

impl From<BrokerError> for skein_domain::Error {
    fn from(e: BrokerError) -> Self {
        skein_domain::Error::Transport(e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live pub/sub subscription. Messages published while subscribed are
/// delivered at-least-once; history is not replayed (subscribers that need
/// catch-up read the backing list first).
///
/// Dropping the subscription detaches it from the channel.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
    /// Forwarding task for implementations that pump an upstream
    /// connection; aborted on drop.
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<String>,
        task: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self { rx, task }
    }

    /// Receive the next message; `None` when the channel is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broker trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Key-value + pub/sub + list-append primitives with TTL.
///
/// Contract:
/// - `set_nx` is linearizable on a single key.
/// - `rpush` preserves arrival order per key.
/// - `publish` delivers at-least-once to currently-subscribed consumers;
///   later subscribers see nothing and must read the list to catch up.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError>;

    /// Atomic create-if-absent. Returns `true` when this call created the
    /// key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BrokerError>;

    async fn delete(&self, key: &str) -> Result<(), BrokerError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Append to a list; returns the new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, BrokerError>;

    /// Pop from the head of a list (work-queue consumption).
    async fn lpop(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Inclusive range read; negative indices count from the tail, as in
    /// Redis (`lrange(key, 0, -1)` reads everything).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, BrokerError>;

    async fn llen(&self, key: &str) -> Result<u64, BrokerError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;

    /// Keys matching a glob pattern (`*` wildcard only). Used for
    /// active-run counting and the orphan sweep.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError>;
}
