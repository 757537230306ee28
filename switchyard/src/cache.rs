//! Redis connection pool and the shared proxy-config cache

use std::time::Duration;

use deadpool_redis::{redis::AsyncCommands, Config as DeadpoolConfig, Pool, Runtime};

use crate::{
    config::RedisConfig,
    error::{Error, Result},
    proxy::ProxyConfig,
};

/// Create a Redis connection pool, retrying with exponential backoff
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!("redis connection established after {} attempt(s)", attempt + 1);
                } else {
                    tracing::info!(
                        "redis connection pool created: max_connections={}",
                        config.max_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "failed to connect to redis after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "redis connection attempt {} failed: {}. Retrying in {:?}",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &RedisConfig) -> Result<Pool> {
    let cfg = DeadpoolConfig::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| Error::Internal(format!("failed to build redis pool: {e}")))?
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Internal(format!("failed to create redis pool: {e}")))?;

    // Fail fast on an unreachable broker
    let conn = pool.get().await?;
    drop(conn);

    Ok(pool)
}

/// Read-through cache of proxy configs, shared by all replicas.
///
/// Entries are invalidated after every committed mutation; the TTL only
/// bounds staleness if an invalidation is lost.
#[derive(Clone)]
pub struct ProxyCache {
    pool: Pool,
    ttl_secs: u64,
}

impl ProxyCache {
    pub fn new(pool: Pool, ttl_secs: u64) -> Self {
        Self { pool, ttl_secs }
    }

    fn key(proxy_id: &str) -> String {
        format!("proxy:{proxy_id}")
    }

    /// Fetch a cached config, if present
    pub async fn get(&self, proxy_id: &str) -> Result<Option<ProxyConfig>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(Self::key(proxy_id)).await?;

        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(config) => Ok(Some(config)),
                Err(e) => {
                    // A corrupt entry behaves like a miss; the next put overwrites it
                    tracing::warn!(proxy_id, "discarding undecodable cache entry: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Store a config with the configured TTL
    pub async fn put(&self, config: &ProxyConfig) -> Result<()> {
        let json = serde_json::to_string(config)
            .map_err(|e| Error::Internal(format!("failed to encode proxy config: {e}")))?;

        let mut conn = self.pool.get().await?;
        let _: () = conn.set_ex(Self::key(&config.id), json, self.ttl_secs).await?;
        Ok(())
    }

    /// Drop the cached entry for a proxy. Idempotent.
    pub async fn invalidate(&self, proxy_id: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(Self::key(proxy_id)).await?;
        Ok(())
    }
}
