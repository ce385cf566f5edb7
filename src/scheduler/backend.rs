//! Storage backends for the task queue.
//!
//! The queue only needs a handful of primitives from its store: a hash for
//! task state, lists for the priority queues, sorted sets for scheduled work.
//! [`QueueBackend`] captures exactly those, so the queue logic runs unchanged
//! against Redis in production and against [`MemoryBackend`] in tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::QueueError;

/// Minimal key-value / list / sorted-set store used by the queue.
///
/// Lists follow Redis orientation: `lpush` adds on the left, `rpush` and
/// `rpop` work on the right.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), QueueError>;
    /// Set `field` only if it is absent. Returns whether this call set it.
    async fn hset_nx(&self, key: &str, field: &str, value: String) -> Result<bool, QueueError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, QueueError>;
    async fn hlen(&self, key: &str) -> Result<usize, QueueError>;

    async fn lpush(&self, key: &str, value: &str) -> Result<(), QueueError>;
    async fn rpush(&self, key: &str, value: &str) -> Result<(), QueueError>;
    async fn rpop(&self, key: &str) -> Result<Option<String>, QueueError>;
    /// Remove every occurrence of `value`, returning how many were removed.
    async fn lrem(&self, key: &str, value: &str) -> Result<usize, QueueError>;
    async fn llen(&self, key: &str) -> Result<usize, QueueError>;
    /// Elements between `start` and `stop` inclusive, counted from the left.
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, QueueError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), QueueError>;
    /// Members with score `<= max`, lowest score first, at most `limit` of them.
    async fn zrange_due(&self, key: &str, max: f64, limit: usize)
        -> Result<Vec<String>, QueueError>;
    /// Remove a member, returning whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, QueueError>;
    async fn zcard(&self, key: &str) -> Result<usize, QueueError>;
}

/// Redis-backed store using a managed, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        info!(redis_url = %redis_url, "Connected to Redis queue backend");

        Ok(Self { conn })
    }

    /// Wraps an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: String) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let set: bool = conn.hset_nx(key, field, value).await?;
        Ok(set)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hlen(&self, key: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.hlen(key).await?;
        Ok(len)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.rpop(key, None).await?;
        Ok(value)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.lrem(key, 0, value).await?;
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(values)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange_due(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let members: Vec<String> = conn
            .zrangebyscore_limit(key, "-inf", max, 0, count)
            .await?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.zcard(key).await?;
        Ok(len)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    // Kept sorted by (score, member).
    sorted_sets: HashMap<String, Vec<(f64, String)>>,
}

/// In-process store with the same semantics as the Redis backend.
///
/// Used by tests and for single-process runs without Redis.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: String) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value);
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hlen(&self, key: &str) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).map_or(0, HashMap::len))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.lists.get_mut(key).and_then(VecDeque::pop_back))
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        Ok(before - list.len())
    }

    async fn llen(&self, key: &str) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, QueueError> {
        let state = self.state.lock().await;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let resolve = |idx: isize| if idx < 0 { len + idx } else { idx };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let set = state.sorted_sets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        let pos = set
            .iter()
            .position(|(s, m)| (*s, m.as_str()) > (score, member))
            .unwrap_or(set.len());
        set.insert(pos, (score, member.to_string()));
        Ok(())
    }

    async fn zrange_due(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .take_while(|(score, _)| *score <= max)
                    .take(limit)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|(_, m)| m != member);
        Ok(set.len() < before)
    }

    async fn zcard(&self, key: &str) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.sorted_sets.get(key).map_or(0, Vec::len))
    }
}
