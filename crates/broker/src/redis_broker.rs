//! Redis-backed broker.
//!
//! Commands run through a [`ConnectionManager`], which reconnects
//! transparently. Each subscription holds its own pub/sub connection with a
//! forwarding task, since Redis pub/sub cannot share a multiplexed command
//! connection.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use skein_domain::config::RedisSettings;

use crate::{Broker, BrokerError, Subscription};

#[derive(Clone)]
pub struct RedisBroker {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisBroker {
    /// Connect using the runtime's Redis settings.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, BrokerError> {
        Self::connect_url(&settings.url()).await
    }

    pub async fn connect_url(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        tracing::info!("connected to redis broker");
        Ok(Self { manager, client })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BrokerError> {
        // SET key value NX EX ttl — linearizable create-if-absent.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.conn().del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.conn().expire::<_, ()>(key, ttl_secs(ttl) as i64).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, BrokerError> {
        Ok(self.conn().rpush(key, value).await?)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.conn().lpop(key, None).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, BrokerError> {
        Ok(self.conn().lrange(key, start as isize, stop as isize).await?)
    }

    async fn llen(&self, key: &str) -> Result<u64, BrokerError> {
        Ok(self.conn().llen(key).await?)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), BrokerError> {
        self.conn().publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();
        let task = tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "non-utf8 pubsub payload dropped");
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(rx, Some(task)))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        Ok(self.conn().keys(pattern).await?)
    }
}
