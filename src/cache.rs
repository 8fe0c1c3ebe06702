// TTL cache layer with a swappable backend
// In-process map by default; Redis when REDIS_HOST is configured

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Keyed TTL store. Values are opaque strings; callers serialise.
/// A `ttl` of `None` means no expiry.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
}

/// Read-through helper: on miss, invoke `producer` once, store a non-empty
/// result under `ttl`, and return it. Concurrent misses may each invoke
/// their own producer; last write wins.
pub async fn get_or_fetch<F, Fut>(
    cache: &dyn Cache,
    key: &str,
    ttl: Option<Duration>,
    producer: F,
) -> Result<Option<String>>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<Option<String>>> + Send,
{
    if let Some(hit) = cache.get(key).await? {
        return Ok(Some(hit));
    }
    let produced = producer().await?;
    if let Some(value) = &produced {
        cache.set(key, value, ttl).await?;
    }
    Ok(produced)
}

// ============================================================================
// In-process backend
// ============================================================================

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_valid(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

/// In-memory TTL cache. Expired entries are dropped on read and
/// opportunistically swept on write.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_valid() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired on the read path; re-check under the write lock in case a
        // concurrent set already replaced it.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.is_valid() {
                return Ok(Some(entry.value.clone()));
            }
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.is_valid());
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }
}

// ============================================================================
// Redis backend
// ============================================================================

/// Redis-backed cache over a multiplexed async connection. The connection
/// handle is cloned per operation, which is how the driver is meant to be
/// shared across tasks.
pub struct RedisCache {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let url = format!("redis://{host}:{port}");
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("invalid redis URL {url}"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("failed to connect to redis at {url}"))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis GET {key}"))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .with_context(|| format!("redis SET {key}"))?;
        Ok(())
    }
}
