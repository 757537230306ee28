//! Tag management for proxies

use chrono::Utc;

use super::Storage;
use crate::error::{Error, Result};

impl Storage {
    /// Replace a proxy's tag set
    pub async fn update_tags(&self, proxy_id: &str, tags: &[String]) -> Result<()> {
        let result = sqlx::query("UPDATE proxies SET tags = $1, updated_at = $2 WHERE id = $3")
            .bind(tags)
            .bind(Utc::now())
            .bind(proxy_id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("proxy {proxy_id}")));
        }

        self.cache().invalidate(proxy_id).await
    }

    /// Tags of one proxy
    pub async fn get_tags(&self, proxy_id: &str) -> Result<Vec<String>> {
        let tags: Option<Vec<String>> =
            sqlx::query_scalar("SELECT tags FROM proxies WHERE id = $1")
                .bind(proxy_id)
                .fetch_optional(self.pool())
                .await?;

        tags.ok_or_else(|| Error::NotFound(format!("proxy {proxy_id}")))
    }

    /// Every tag in use, deduplicated
    pub async fn get_all_tags(&self) -> Result<Vec<String>> {
        let tags: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT unnest(tags) AS tag FROM proxies ORDER BY tag",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(tags)
    }

    /// IDs of proxies carrying any of the given tags
    pub async fn proxy_ids_by_tags(&self, tags: &[String]) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM proxies WHERE tags && $1 ORDER BY created_at DESC",
        )
        .bind(tags)
        .fetch_all(self.pool())
        .await?;

        Ok(ids)
    }
}
