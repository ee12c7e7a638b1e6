//! In-memory broker used by tests and local development.
//!
//! Single-process semantics: `set_nx` atomicity comes from the interior
//! mutex, pub/sub from a `tokio::sync::broadcast` channel per topic. TTLs
//! are enforced lazily on access.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::{Broker, BrokerError, Subscription};

#[derive(Debug, Clone)]
enum Stored {
    Value(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    stored: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Per-channel fan-out capacity. Slow in-memory subscribers that lag past
/// this many messages miss the older ones and recover via list replay.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// The in-memory [`Broker`] implementation.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live_entry<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> R) -> R {
        let mut inner = self.inner.lock();
        if inner.entries.get(key).is_some_and(Entry::expired) {
            inner.entries.remove(key);
        }
        f(inner.entries.get_mut(key))
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut inner = self.inner.lock();
        inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    // Only `*` is supported; split the pattern on stars and require the
    // fragments to appear in order, anchored at both ends.
    let mut remainder = key;
    let mut fragments = pattern.split('*').peekable();
    let anchored_start = !pattern.starts_with('*');
    let mut first = true;
    while let Some(frag) = fragments.next() {
        if frag.is_empty() {
            first = false;
            continue;
        }
        match remainder.find(frag) {
            Some(pos) => {
                if first && anchored_start && pos != 0 {
                    return false;
                }
                remainder = &remainder[pos + frag.len()..];
            }
            None => return false,
        }
        if fragments.peek().is_none() && !pattern.ends_with('*') && !remainder.is_empty() {
            return false;
        }
        first = false;
    }
    true
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(Entry { stored: Stored::Value(v), .. }) => Some(v.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        inner.entries.insert(
            key.to_string(),
            Entry {
                stored: Stored::Value(value.to_string()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut inner = self.inner.lock();
        if inner.entries.get(key).is_some_and(Entry::expired) {
            inner.entries.remove(key);
        }
        if inner.entries.contains_key(key) {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                stored: Stored::Value(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.inner.lock().entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.with_live_entry(key, |entry| {
            if let Some(entry) = entry {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, BrokerError> {
        let mut inner = self.inner.lock();
        if inner.entries.get(key).is_some_and(Entry::expired) {
            inner.entries.remove(key);
        }
        let entry = inner.entries.entry(key.to_string()).or_insert(Entry {
            stored: Stored::List(Vec::new()),
            expires_at: None,
        });
        match &mut entry.stored {
            Stored::List(items) => {
                items.push(value.to_string());
                Ok(items.len() as u64)
            }
            Stored::Value(_) => Err(BrokerError::Command(format!(
                "rpush on non-list key {key}"
            ))),
        }
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(Entry { stored: Stored::List(items), .. }) if !items.is_empty() => {
                Some(items.remove(0))
            }
            _ => None,
        }))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, BrokerError> {
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(Entry { stored: Stored::List(items), .. }) => {
                let len = items.len() as i64;
                let norm = |idx: i64| -> i64 {
                    if idx < 0 {
                        (len + idx).max(0)
                    } else {
                        idx
                    }
                };
                let from = norm(start).min(len) as usize;
                let to = norm(stop).min(len - 1);
                if to < from as i64 {
                    return Vec::new();
                }
                items[from..=(to as usize)].to_vec()
            }
            _ => Vec::new(),
        }))
    }

    async fn llen(&self, key: &str) -> Result<u64, BrokerError> {
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(Entry { stored: Stored::List(items), .. }) => items.len() as u64,
            _ => 0,
        }))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), BrokerError> {
        // A send error just means nobody is subscribed; publishing must not
        // block or fail on absent subscribers.
        let _ = self.sender(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut bc_rx = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                match bc_rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "in-memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx, Some(task)))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut inner = self.inner.lock();
        inner.entries.retain(|_, e| !e.expired());
        Ok(inner
            .entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }
}
