//! Relational persistence: proxies, listen URLs, targets, the change
//! journal, users, and recorded visits
//!
//! Storage is the source of truth shared by every replica. Each mutating
//! operation runs in one transaction that applies the state change and
//! appends the journal row, then invalidates the Redis cache entry. Reads go
//! through the cache.

mod changes;
mod tags;
mod users;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    cache::ProxyCache,
    error::{Error, Result},
    models::{ListenUrl, Proxy, ProxyMode, RouteCondition, Target},
    proxy::{self, ProxyConfig},
    supervisor::ConfigSource,
};

/// Storage handle: Postgres pool plus the shared config cache
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
    cache: ProxyCache,
}

#[derive(sqlx::FromRow)]
struct ProxyRow {
    id: String,
    name: Option<String>,
    mode: String,
    condition: Option<serde_json::Value>,
    tags: Vec<String>,
    saving_cookies_flg: bool,
    query_forwarding_flg: bool,
    cookies_forwarding_flg: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ListenUrlRow {
    id: String,
    proxy_id: String,
    listen_url: String,
    path_key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    id: String,
    proxy_id: String,
    url: String,
    weight: f64,
    is_active: bool,
}

/// Per-target visit counts read back from the `visits` table
#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct TargetVisitStats {
    pub target_id: String,
    pub visits: i64,
    pub unique_users: i64,
}

/// Per-proxy visit counts
#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct ProxyVisitStats {
    pub proxy_id: String,
    pub visits: i64,
    pub unique_users: i64,
}

impl Storage {
    pub fn new(pool: PgPool, cache: ProxyCache) -> Self {
        Self { pool, cache }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn cache(&self) -> &ProxyCache {
        &self.cache
    }

    /// Create the schema. Safe to run on every startup.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id TEXT PRIMARY KEY,
                name TEXT,
                mode TEXT NOT NULL,
                condition JSONB,
                tags TEXT[] NOT NULL DEFAULT '{}',
                saving_cookies_flg BOOLEAN NOT NULL DEFAULT FALSE,
                query_forwarding_flg BOOLEAN NOT NULL DEFAULT FALSE,
                cookies_forwarding_flg BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxy_listen_urls (
                id TEXT PRIMARY KEY,
                proxy_id TEXT NOT NULL REFERENCES proxies (id) ON DELETE CASCADE,
                listen_url TEXT NOT NULL,
                path_key TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (proxy_id, listen_url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id TEXT PRIMARY KEY,
                proxy_id TEXT NOT NULL REFERENCES proxies (id) ON DELETE CASCADE,
                url TEXT NOT NULL,
                weight DOUBLE PRECISION NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxy_changes (
                id TEXT PRIMARY KEY,
                proxy_id TEXT NOT NULL,
                change_type TEXT NOT NULL,
                previous_state JSONB,
                new_state JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                created_by TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_proxy_changes_proxy \
             ON proxy_changes (proxy_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS visits (
                id TEXT PRIMARY KEY,
                proxy_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                rid TEXT NOT NULL,
                rrid TEXT NOT NULL,
                ruid TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_visits_proxy ON visits (proxy_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("storage schema ready");
        Ok(())
    }

    /// Full proxy record, straight from the tables
    pub async fn get_proxy(&self, proxy_id: &str) -> Result<Proxy> {
        let row = sqlx::query_as::<_, ProxyRow>(
            "SELECT id, name, mode, condition, tags, saving_cookies_flg, \
             query_forwarding_flg, cookies_forwarding_flg, created_at, updated_at \
             FROM proxies WHERE id = $1",
        )
        .bind(proxy_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("proxy {proxy_id}")))?;

        let listen_urls = self.listen_urls(proxy_id).await?;
        let targets = self.targets(proxy_id).await?;

        proxy_from_rows(row, listen_urls, targets)
    }

    /// Every proxy record (admin listing)
    pub async fn get_proxies(&self) -> Result<Vec<Proxy>> {
        let rows = sqlx::query_as::<_, ProxyRow>(
            "SELECT id, name, mode, condition, tags, saving_cookies_flg, \
             query_forwarding_flg, cookies_forwarding_flg, created_at, updated_at \
             FROM proxies ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut proxies = Vec::with_capacity(rows.len());
        for row in rows {
            let listen_urls = self.listen_urls(&row.id).await?;
            let targets = self.targets(&row.id).await?;
            proxies.push(proxy_from_rows(row, listen_urls, targets)?);
        }
        Ok(proxies)
    }

    /// Runtime config for one proxy, read through the cache
    pub async fn get_proxy_config(&self, proxy_id: &str) -> Result<ProxyConfig> {
        match self.cache.get(proxy_id).await {
            Ok(Some(config)) => return Ok(config),
            Ok(None) => {}
            Err(e) => {
                // Degrade to a database read when the cache is unreachable
                tracing::warn!(proxy_id, "cache read failed: {}", e);
            }
        }

        let config = config_from(self.get_proxy(proxy_id).await?);

        if let Err(e) = self.cache.put(&config).await {
            tracing::warn!(proxy_id, "cache fill failed: {}", e);
        }

        Ok(config)
    }

    /// Persist a new proxy with its listen URLs and targets. IDs are minted
    /// for any record that arrives without one.
    pub async fn create_proxy(&self, proxy: &mut Proxy) -> Result<()> {
        if proxy.id.is_empty() {
            proxy.id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        proxy.created_at = now;
        proxy.updated_at = now;

        let condition_json = proxy
            .condition
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| Error::Internal(format!("failed to encode condition: {e}")))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO proxies \
             (id, name, mode, condition, tags, saving_cookies_flg, \
              query_forwarding_flg, cookies_forwarding_flg, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&proxy.id)
        .bind(&proxy.name)
        .bind(proxy.mode.as_str())
        .bind(condition_json)
        .bind(&proxy.tags)
        .bind(proxy.save_cookies)
        .bind(proxy.forward_query)
        .bind(proxy.forward_cookies)
        .bind(proxy.created_at)
        .bind(proxy.updated_at)
        .execute(&mut *tx)
        .await?;

        for listen_url in &mut proxy.listen_urls {
            if listen_url.id.is_empty() {
                listen_url.id = Uuid::new_v4().to_string();
            }
            listen_url.proxy_id = proxy.id.clone();
            listen_url.created_at = now;
            listen_url.updated_at = now;

            sqlx::query(
                "INSERT INTO proxy_listen_urls \
                 (id, proxy_id, listen_url, path_key, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&listen_url.id)
            .bind(&listen_url.proxy_id)
            .bind(&listen_url.listen_url)
            .bind(&listen_url.path_key)
            .bind(listen_url.created_at)
            .bind(listen_url.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for target in &mut proxy.targets {
            if target.id.is_empty() {
                target.id = Uuid::new_v4().to_string();
            }
            target.proxy_id = proxy.id.clone();

            sqlx::query(
                "INSERT INTO targets (id, proxy_id, url, weight, is_active) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&target.id)
            .bind(&target.proxy_id)
            .bind(&target.url)
            .bind(target.weight)
            .bind(target.is_active)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a proxy and everything scoped to it
    pub async fn delete_proxy(&self, proxy_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM proxies WHERE id = $1")
            .bind(proxy_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("proxy {proxy_id}")));
        }

        self.cache.invalidate(proxy_id).await?;
        Ok(())
    }

    /// Per-target visit counts within a time window
    pub async fn target_visit_stats(
        &self,
        proxy_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TargetVisitStats>> {
        let rows = sqlx::query_as::<_, TargetVisitStats>(
            "SELECT target_id, COUNT(*) AS visits, COUNT(DISTINCT user_id) AS unique_users \
             FROM visits \
             WHERE proxy_id = $1 AND created_at >= $2 AND created_at < $3 \
             GROUP BY target_id ORDER BY target_id",
        )
        .bind(proxy_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Per-proxy visit counts across all time
    pub async fn proxy_visit_stats(&self) -> Result<Vec<ProxyVisitStats>> {
        let rows = sqlx::query_as::<_, ProxyVisitStats>(
            "SELECT proxy_id, COUNT(*) AS visits, COUNT(DISTINCT user_id) AS unique_users \
             FROM visits GROUP BY proxy_id ORDER BY proxy_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn listen_urls(&self, proxy_id: &str) -> Result<Vec<ListenUrlRow>> {
        let rows = sqlx::query_as::<_, ListenUrlRow>(
            "SELECT id, proxy_id, listen_url, path_key, created_at, updated_at \
             FROM proxy_listen_urls WHERE proxy_id = $1 ORDER BY created_at",
        )
        .bind(proxy_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn targets(&self, proxy_id: &str) -> Result<Vec<TargetRow>> {
        let rows = sqlx::query_as::<_, TargetRow>(
            "SELECT id, proxy_id, url, weight, is_active \
             FROM targets WHERE proxy_id = $1 ORDER BY id",
        )
        .bind(proxy_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl ConfigSource for Storage {
    async fn proxy_config(&self, proxy_id: &str) -> Result<ProxyConfig> {
        self.get_proxy_config(proxy_id).await
    }

    async fn proxy_configs(&self) -> Result<Vec<ProxyConfig>> {
        Ok(self.get_proxies().await?.into_iter().map(config_from).collect())
    }
}

fn proxy_from_rows(
    row: ProxyRow,
    listen_urls: Vec<ListenUrlRow>,
    targets: Vec<TargetRow>,
) -> Result<Proxy> {
    let mode = ProxyMode::parse(&row.mode)
        .ok_or_else(|| Error::Internal(format!("proxy {} has unknown mode {}", row.id, row.mode)))?;

    let condition: Option<RouteCondition> = row
        .condition
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| Error::Internal(format!("proxy {} has undecodable condition: {e}", row.id)))?;

    Ok(Proxy {
        id: row.id,
        name: row.name.unwrap_or_default(),
        mode,
        listen_urls: listen_urls
            .into_iter()
            .map(|lu| ListenUrl {
                id: lu.id,
                proxy_id: lu.proxy_id,
                listen_url: lu.listen_url,
                path_key: lu.path_key,
                created_at: lu.created_at,
                updated_at: lu.updated_at,
            })
            .collect(),
        targets: targets
            .into_iter()
            .map(|t| Target {
                id: t.id,
                proxy_id: t.proxy_id,
                url: t.url,
                weight: t.weight,
                is_active: t.is_active,
            })
            .collect(),
        condition,
        tags: row.tags,
        save_cookies: row.saving_cookies_flg,
        forward_query: row.query_forwarding_flg,
        forward_cookies: row.cookies_forwarding_flg,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

/// Project a persistent record onto the runtime config shape
pub fn config_from(proxy: Proxy) -> ProxyConfig {
    ProxyConfig {
        id: proxy.id,
        name: proxy.name,
        mode: proxy.mode,
        listen_urls: proxy
            .listen_urls
            .into_iter()
            .map(|lu| proxy::ListenUrl {
                id: lu.id,
                listen_url: lu.listen_url,
                path_key: lu.path_key,
            })
            .collect(),
        targets: proxy
            .targets
            .into_iter()
            .map(|t| proxy::Target {
                id: t.id,
                url: t.url,
                weight: t.weight,
                is_active: t.is_active,
            })
            .collect(),
        condition: proxy.condition,
        tags: proxy.tags,
        save_cookies: proxy.save_cookies,
        forward_query: proxy.forward_query,
        forward_cookies: proxy.forward_cookies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_projection_drops_persistence_fields() {
        let now = Utc::now();
        let proxy = Proxy {
            id: "p1".to_string(),
            name: "landing split".to_string(),
            mode: ProxyMode::Redirect,
            listen_urls: vec![ListenUrl {
                id: "lu1".to_string(),
                proxy_id: "p1".to_string(),
                listen_url: "ab.example.com".to_string(),
                path_key: None,
                created_at: now,
                updated_at: now,
            }],
            targets: vec![Target {
                id: "t1".to_string(),
                proxy_id: "p1".to_string(),
                url: "https://a.example.com/".to_string(),
                weight: 1.0,
                is_active: true,
            }],
            condition: None,
            tags: vec!["landing".to_string()],
            save_cookies: true,
            forward_query: false,
            forward_cookies: false,
            created_at: now,
            updated_at: now,
        };

        let config = config_from(proxy);
        assert_eq!(config.id, "p1");
        assert_eq!(config.listen_urls[0].listen_url, "ab.example.com");
        assert_eq!(config.targets[0].id, "t1");
        assert!(config.save_cookies);
    }
}
