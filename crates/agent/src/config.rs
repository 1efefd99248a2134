use models::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Environment scope of database-held configuration rows.
const DEFAULT_ENVIRONMENT: &str = "default";

/// Runtime knobs recognized by the core.
pub const BASIC_SYNC_LOG_RETENTION_DAYS: &str = "basic_sync_log_retention_days";
pub const THEMATIC_SYNC_LOG_RETENTION_DAYS: &str = "thematic_sync_log_retention_days";
pub const DEFAULT_LOG_RETENTION_DAYS: i64 = 7;

/// ConfigService resolves runtime knobs with the precedence
/// database > environment variable (`DATAHUB_<UPPER_KEY>`) > default.
/// Database lookups are cached per key; the cache is invalidated by
/// `set`, `delete`, and `clear_cache`.
pub struct ConfigService {
    pool: Option<sqlx::PgPool>,
    cache: RwLock<HashMap<String, Option<String>>>,
}

impl ConfigService {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool: Some(pool),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// A service with no backing database; only env and defaults resolve.
    pub fn detached() -> Self {
        Self {
            pool: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn env_var_name(key: &str) -> String {
        format!("DATAHUB_{}", key.to_ascii_uppercase())
    }

    async fn db_value(&self, key: &str) -> Option<String> {
        if let Some(cached) = self.cache.read().await.get(key) {
            return cached.clone();
        }

        let Some(pool) = &self.pool else {
            return None;
        };
        let value = match datahub_sql::system_configs::get(key, DEFAULT_ENVIRONMENT, pool).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key, %err, "config lookup failed; falling back to env/default");
                return None; // Do not cache failures.
            }
        };
        self.cache
            .write()
            .await
            .insert(key.to_string(), value.clone());
        value
    }

    /// Resolve a key through the full precedence chain, or None when no
    /// layer holds it.
    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.db_value(key).await {
            return Some(value);
        }
        std::env::var(Self::env_var_name(key)).ok()
    }

    pub async fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).await.unwrap_or_else(|| default.to_string())
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.get(key).await {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, raw, "config value is not an integer; using default");
                default
            }),
            None => default,
        }
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).await {
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => {
                    tracing::warn!(key, raw, "config value is not a boolean; using default");
                    default
                }
            },
            None => default,
        }
    }

    pub async fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key).await {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, raw, "config value is not a number; using default");
                default
            }),
            None => default,
        }
    }

    /// Write a knob to the database and invalidate its cache entry.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        if let Some(pool) = &self.pool {
            datahub_sql::system_configs::set(key, value, DEFAULT_ENVIRONMENT, pool).await?;
        }
        self.cache.write().await.remove(key);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        if let Some(pool) = &self.pool {
            datahub_sql::system_configs::delete(key, DEFAULT_ENVIRONMENT, pool).await?;
        }
        self.cache.write().await.remove(key);
        Ok(())
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod test {
    use super::ConfigService;
    use serial_test::serial;

    // Env-var mutation is process-global; these tests serialize.

    #[tokio::test]
    #[serial]
    async fn test_env_beats_default() {
        let config = ConfigService::detached();
        std::env::set_var("DATAHUB_TEST_RETENTION_A", "14");

        assert_eq!(config.get_i64("test_retention_a", 7).await, 14);

        std::env::remove_var("DATAHUB_TEST_RETENTION_A");
        assert_eq!(config.get_i64("test_retention_a", 7).await, 7);
    }

    #[tokio::test]
    #[serial]
    async fn test_typed_getters_fall_back_on_garbage() {
        let config = ConfigService::detached();
        std::env::set_var("DATAHUB_TEST_RETENTION_B", "not-a-number");
        assert_eq!(config.get_i64("test_retention_b", 7).await, 7);
        std::env::remove_var("DATAHUB_TEST_RETENTION_B");

        std::env::set_var("DATAHUB_TEST_FLAG", "on");
        assert!(config.get_bool("test_flag", false).await);
        std::env::set_var("DATAHUB_TEST_FLAG", "definitely");
        assert!(!config.get_bool("test_flag", false).await);
        std::env::remove_var("DATAHUB_TEST_FLAG");
    }

    #[tokio::test]
    #[serial]
    async fn test_detached_set_only_touches_cache() {
        let config = ConfigService::detached();
        config.set("test_key_c", "x").await.unwrap();
        assert_eq!(config.get("test_key_c").await, None);
        config.clear_cache().await;
    }
}
