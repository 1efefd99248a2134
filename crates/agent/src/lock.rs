use models::{Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// DistributedLock coordinates scheduled fires across process instances.
/// A successful try_lock excludes every other holder of the same key for
/// at least `ttl`; locks auto-expire, so callers size `ttl` beyond their
/// worst-case critical section.
#[async_trait::async_trait]
pub trait DistributedLock: Send + Sync {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn unlock(&self, key: &str) -> Result<()>;

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<bool>;
}

const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const REFRESH_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// RedisLock implements the lock over a shared Redis store with
/// `SET key token NX PX`. The release and refresh are token-checked so an
/// expired lock taken over by another process is never touched.
pub struct RedisLock {
    client: ::redis::Client,
    token: String,
    prefix: String,
}

impl RedisLock {
    pub fn new(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|err| Error::Remote(anyhow::anyhow!("opening redis lock store: {err}")))?;
        Ok(Self {
            client,
            token: uuid::Uuid::new_v4().to_string(),
            prefix: "datahub:lock:".to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    async fn connection(&self) -> Result<::redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| Error::Remote(anyhow::anyhow!("connecting to redis lock store: {err}")))
    }
}

#[async_trait::async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let set: Option<String> = ::redis::cmd("SET")
            .arg(self.key(key))
            .arg(&self.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|err| Error::Remote(anyhow::anyhow!("redis SET NX: {err}")))?;
        Ok(set.is_some())
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _released: i64 = ::redis::Script::new(UNLOCK_SCRIPT)
            .key(self.key(key))
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| Error::Remote(anyhow::anyhow!("redis unlock: {err}")))?;
        Ok(())
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let refreshed: i64 = ::redis::Script::new(REFRESH_SCRIPT)
            .key(self.key(key))
            .arg(&self.token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| Error::Remote(anyhow::anyhow!("redis refresh: {err}")))?;
        Ok(refreshed == 1)
    }
}

/// MemoryLock is the single-instance fallback used when no lock store is
/// configured, and in tests. It provides the same exclusion within one
/// process only.
#[derive(Default)]
pub struct MemoryLock {
    entries: tokio::sync::Mutex<HashMap<String, Instant>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DistributedLock for MemoryLock {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, expires| *expires > now);

        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(expires) => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{DistributedLock, MemoryLock};
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_lock_excludes_second_holder() {
        let lock = MemoryLock::new();
        assert!(lock.try_lock("a", Duration::from_secs(10)).await.unwrap());
        assert!(!lock.try_lock("a", Duration::from_secs(10)).await.unwrap());
        assert!(lock.try_lock("b", Duration::from_secs(10)).await.unwrap());

        lock.unlock("a").await.unwrap();
        assert!(lock.try_lock("a", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_lock_expires() {
        let lock = MemoryLock::new();
        assert!(lock.try_lock("a", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock.try_lock("a", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_lock_refresh() {
        let lock = MemoryLock::new();
        assert!(!lock.refresh("a", Duration::from_secs(1)).await.unwrap());
        assert!(lock.try_lock("a", Duration::from_millis(10)).await.unwrap());
        assert!(lock.refresh("a", Duration::from_secs(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!lock.try_lock("a", Duration::from_secs(1)).await.unwrap());
    }
}
