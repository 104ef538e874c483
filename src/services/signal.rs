//! Best-effort cancellation notices for running executors.
//!
//! The channel is lossy: a missed notice only delays an abort, the conditional
//! status writes decide the outcome.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::models::task::TaskId;

const KEY_PREFIX: &str = "imagegen:cancel:";

#[async_trait]
pub trait CancelSignal: Send + Sync {
    async fn notify(&self, id: TaskId);

    async fn is_cancelled(&self, id: TaskId) -> bool;

    async fn clear(&self, id: TaskId);

    async fn health_check(&self) -> Result<(), SignalError> {
        Ok(())
    }

    fn backend(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Default)]
struct Recent {
    ids: HashSet<TaskId>,
    order: VecDeque<TaskId>,
}

/// In-process set of cancelled ids. The oldest ids are evicted past `capacity`.
#[derive(Debug)]
pub struct LocalCancelSignal {
    recent: Mutex<Recent>,
    capacity: usize,
}

impl LocalCancelSignal {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(Recent::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recent> {
        self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LocalCancelSignal {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CancelSignal for LocalCancelSignal {
    async fn notify(&self, id: TaskId) {
        let mut recent = self.lock();
        if !recent.ids.insert(id) {
            return;
        }
        recent.order.push_back(id);
        while recent.order.len() > self.capacity {
            if let Some(evicted) = recent.order.pop_front() {
                recent.ids.remove(&evicted);
            }
        }
    }

    async fn is_cancelled(&self, id: TaskId) -> bool {
        self.lock().ids.contains(&id)
    }

    async fn clear(&self, id: TaskId) {
        let mut recent = self.lock();
        if recent.ids.remove(&id) {
            recent.order.retain(|queued| *queued != id);
        }
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

/// Redis keys with a TTL, shared by every process that runs executors.
pub struct RedisCancelSignal {
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisCancelSignal {
    pub fn new(redis_url: &str, ttl_secs: u64) -> Result<Self, SignalError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, ttl_secs })
    }

    fn key(id: TaskId) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    async fn set(&self, id: TaskId) -> Result<(), SignalError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(Self::key(id), 1u8, self.ttl_secs).await?;
        Ok(())
    }

    async fn exists(&self, id: TaskId) -> Result<bool, SignalError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let found: bool = conn.exists(Self::key(id)).await?;
        Ok(found)
    }

    async fn delete(&self, id: TaskId) -> Result<(), SignalError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(Self::key(id)).await?;
        Ok(())
    }
}

#[async_trait]
impl CancelSignal for RedisCancelSignal {
    async fn notify(&self, id: TaskId) {
        if let Err(e) = self.set(id).await {
            tracing::warn!(task_id = %id, error = %e, "Failed to publish cancel notice");
        }
    }

    async fn is_cancelled(&self, id: TaskId) -> bool {
        match self.exists(id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "Failed to read cancel notice");
                false
            }
        }
    }

    async fn clear(&self, id: TaskId) {
        if let Err(e) = self.delete(id).await {
            tracing::debug!(task_id = %id, error = %e, "Failed to clear cancel notice");
        }
    }

    async fn health_check(&self) -> Result<(), SignalError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
