//! Two-tier read-through cache: remote key-value store primary with an
//! in-process fallback. Values are always JSON; keys carry a namespace and
//! a digest of the call arguments.

mod memory;

pub use memory::MemoryTier;

use crate::config::CacheTtlConfig;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const NAMESPACE: &str = "kquant";
const REDIS_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Cache operation classes, each with its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    Price,
    Ohlcv,
    Financial,
    Universe,
}

/// Build the canonical cache key: `kquant:{scope}:{sha256(args)[..16]}`.
/// `scope` names the calling module and function; `args` must serialize
/// identically across processes for the digest to agree.
pub fn cache_key<A: Serialize>(scope: &str, args: &A) -> String {
    let canonical = serde_json::to_string(args).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{NAMESPACE}:{scope}:{}", &hex::encode(digest)[..16])
}

pub struct Cache {
    redis: Option<tokio::sync::Mutex<RedisState>>,
    memory: MemoryTier,
    ttls: CacheTtlConfig,
    primary_down: AtomicBool,
}

struct RedisState {
    client: redis::Client,
    manager: Option<redis::aio::ConnectionManager>,
}

impl Cache {
    /// Without a redis URL the cache runs on the in-process tier alone.
    pub fn new(redis_url: Option<&str>, ttls: CacheTtlConfig) -> Self {
        let redis = redis_url.and_then(|url| match redis::Client::open(url) {
            Ok(client) => Some(tokio::sync::Mutex::new(RedisState {
                client,
                manager: None,
            })),
            Err(e) => {
                warn!("Invalid redis URL, cache will run in-process only: {}", e);
                None
            }
        });
        Self {
            redis,
            memory: MemoryTier::new(),
            ttls,
            primary_down: AtomicBool::new(false),
        }
    }

    pub fn ttl(&self, class: TtlClass) -> Duration {
        let secs = match class {
            TtlClass::Price => self.ttls.price,
            TtlClass::Ohlcv => self.ttls.ohlcv,
            TtlClass::Financial => self.ttls.financial,
            TtlClass::Universe => self.ttls.universe,
        };
        Duration::from_secs(secs)
    }

    /// True while the primary tier is demoted.
    pub fn primary_down(&self) -> bool {
        self.primary_down.load(Ordering::Relaxed)
    }

    /// Read-through helper: deserialize a hit, otherwise run `fetch`, store
    /// the result in both tiers, and return it.
    pub async fn remember<T, F, Fut, E>(
        &self,
        scope: &str,
        args: &impl Serialize,
        class: TtlClass,
        fetch: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = cache_key(scope, args);
        if let Some(value) = self.get(&key).await {
            match serde_json::from_value::<T>(value) {
                Ok(hit) => return Ok(hit),
                Err(e) => {
                    // Corrupted entries are dropped, never returned.
                    warn!("Corrupted cache entry for {}, refetching: {}", key, e);
                    self.delete(&key).await;
                }
            }
        }

        let fresh = fetch().await?;
        if let Ok(value) = serde_json::to_value(&fresh) {
            self.put(&key, value, self.ttl(class)).await;
        }
        Ok(fresh)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(raw) = self.redis_get(key).await {
            return serde_json::from_str(&raw).ok();
        }
        self.memory.get(key)
    }

    pub async fn put(&self, key: &str, value: Value, ttl: Duration) {
        let body = value.to_string();
        self.memory.put(key.to_string(), value, ttl);
        self.redis_put(key, body, ttl).await;
    }

    pub async fn delete(&self, key: &str) {
        self.memory.delete(key);
        if let Some(mut conn) = self.connection().await {
            let _ = tokio::time::timeout(REDIS_OP_TIMEOUT, conn.del::<_, ()>(key)).await;
        }
    }

    /// Midnight flush: scan-and-delete everything under this namespace.
    /// Never a whole-store flush; other tenants of the store are untouched.
    pub async fn flush_namespace(&self) {
        self.memory.clear();
        let Some(mut conn) = self.connection().await else {
            return;
        };

        let pattern = format!("{NAMESPACE}:*");
        let keys: Vec<String> = {
            let mut scan = match conn.scan_match::<_, String>(&pattern).await {
                Ok(iter) => iter,
                Err(e) => {
                    self.mark_primary_down(&e);
                    return;
                }
            };
            let mut keys = Vec::new();
            while let Some(key) = scan.next_item().await {
                keys.push(key);
            }
            keys
        };

        if keys.is_empty() {
            info!("Cache flush: namespace already empty");
            return;
        }
        match tokio::time::timeout(REDIS_OP_TIMEOUT, conn.del::<_, usize>(keys.clone())).await {
            Ok(Ok(n)) => info!("Cache flush: removed {} keys", n),
            Ok(Err(e)) => self.mark_primary_down(&e),
            Err(_) => warn!("Cache flush timed out deleting {} keys", keys.len()),
        }
    }

    /// Liveness probe for telemetry.
    pub async fn ping_primary(&self) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let pong: Result<redis::RedisResult<String>, _> = tokio::time::timeout(
            REDIS_OP_TIMEOUT,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await;
        match pong {
            Ok(Ok(_)) => {
                self.mark_primary_up();
                true
            }
            _ => {
                self.primary_down.store(true, Ordering::Relaxed);
                false
            }
        }
    }

    async fn redis_get(&self, key: &str) -> Option<String> {
        let mut conn = self.connection().await?;
        match tokio::time::timeout(REDIS_OP_TIMEOUT, conn.get::<_, Option<String>>(key)).await {
            Ok(Ok(hit)) => {
                self.mark_primary_up();
                hit
            }
            Ok(Err(e)) => {
                self.mark_primary_down(&e);
                None
            }
            Err(_) => {
                warn!("Redis GET timed out for {}", key);
                self.primary_down.store(true, Ordering::Relaxed);
                None
            }
        }
    }

    async fn redis_put(&self, key: &str, body: String, ttl: Duration) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let result = tokio::time::timeout(
            REDIS_OP_TIMEOUT,
            conn.set_ex::<_, _, ()>(key, body, ttl.as_secs().max(1)),
        )
        .await;
        match result {
            Ok(Ok(())) => self.mark_primary_up(),
            Ok(Err(e)) => self.mark_primary_down(&e),
            Err(_) => {
                warn!("Redis SET timed out for {}", key);
                self.primary_down.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Lazily establish (and opportunistically re-establish) the primary
    /// connection. Failure demotes the call to the fallback tier.
    async fn connection(&self) -> Option<redis::aio::ConnectionManager> {
        let state = self.redis.as_ref()?;
        let mut state = state.lock().await;
        if let Some(manager) = state.manager.as_ref() {
            return Some(manager.clone());
        }
        let connect = tokio::time::timeout(
            REDIS_OP_TIMEOUT,
            state.client.get_connection_manager(),
        )
        .await;
        match connect {
            Ok(Ok(manager)) => {
                state.manager = Some(manager.clone());
                self.mark_primary_up();
                Some(manager)
            }
            Ok(Err(e)) => {
                self.mark_primary_down(&e);
                None
            }
            Err(_) => {
                if !self.primary_down.swap(true, Ordering::Relaxed) {
                    warn!("Redis connect timed out, falling back to in-process cache");
                }
                None
            }
        }
    }

    fn mark_primary_down(&self, error: &redis::RedisError) {
        if !self.primary_down.swap(true, Ordering::Relaxed) {
            warn!("Redis unavailable, falling back to in-process cache: {}", error);
        }
    }

    fn mark_primary_up(&self) {
        if self.primary_down.swap(false, Ordering::Relaxed) {
            info!("Redis recovered, resuming primary cache tier");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> Cache {
        Cache::new(None, CacheTtlConfig::default())
    }

    #[test]
    fn test_key_shape_and_stability() {
        let a = cache_key("broker.get_price", &("005930",));
        let b = cache_key("broker.get_price", &("005930",));
        let c = cache_key("broker.get_price", &("000660",));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("kquant:broker.get_price:"));
        let digest = a.rsplit(':').next().unwrap();
        assert_eq!(digest.len(), 16);
    }

    #[tokio::test]
    async fn test_remember_fetches_once() {
        let cache = cache();
        let mut calls = 0u32;

        for _ in 0..3 {
            let value: Result<u64, std::convert::Infallible> = cache
                .remember("quotes.current", &("005930",), TtlClass::Price, || {
                    calls += 1;
                    async { Ok(42u64) }
                })
                .await;
            assert_eq!(value.unwrap(), 42);
        }
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_corrupted_entry_is_refetched() {
        let cache = cache();
        let key = cache_key("quotes.current", &("005930",));
        // A string where a number is expected.
        cache
            .put(&key, json!("not-a-number"), Duration::from_secs(60))
            .await;

        let value: Result<u64, std::convert::Infallible> = cache
            .remember("quotes.current", &("005930",), TtlClass::Price, || async {
                Ok(7u64)
            })
            .await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_flush_clears_memory_tier() {
        let cache = cache();
        cache
            .put("kquant:a", json!(1), Duration::from_secs(60))
            .await;
        cache
            .put("kquant:b", json!(2), Duration::from_secs(60))
            .await;
        cache.flush_namespace().await;
        assert_eq!(cache.get("kquant:a").await, None);
        assert_eq!(cache.get("kquant:b").await, None);
    }

    #[tokio::test]
    async fn test_ttl_classes_map_to_config() {
        let cache = cache();
        assert_eq!(cache.ttl(TtlClass::Price), Duration::from_secs(300));
        assert_eq!(cache.ttl(TtlClass::Ohlcv), Duration::from_secs(600));
        assert_eq!(cache.ttl(TtlClass::Financial), Duration::from_secs(21_600));
        assert_eq!(cache.ttl(TtlClass::Universe), Duration::from_secs(86_400));
    }
}
