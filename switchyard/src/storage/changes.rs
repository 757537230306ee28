//! Mutating proxy operations and the append-only change journal
//!
//! Every mutation runs in a single transaction: the state change plus one
//! `proxy_changes` row holding the before/after snapshots. The cache entry is
//! invalidated only after the commit, and the caller publishes the change
//! notice only after the invalidation; that ordering is what keeps peers
//! from re-reading a stale cache.

use chrono::Utc;
use serde_json::json;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::Storage;
use crate::{
    error::{Error, Result},
    models::{ChangeKind, ProxyChange, ProxyMode, RouteCondition, Target},
};

#[derive(sqlx::FromRow)]
struct ChangeRow {
    id: String,
    proxy_id: String,
    change_type: String,
    previous_state: Option<serde_json::Value>,
    new_state: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
    created_by: Option<String>,
}

impl From<ChangeRow> for ProxyChange {
    fn from(row: ChangeRow) -> Self {
        ProxyChange {
            id: row.id,
            proxy_id: row.proxy_id,
            change_kind: row.change_type,
            previous_state: row.previous_state,
            new_state: row.new_state,
            created_at: row.created_at,
            created_by: row.created_by,
        }
    }
}

impl Storage {
    /// Replace a proxy's target list wholesale, together with the condition
    /// that references it.
    ///
    /// Targets are replaced, never patched: the old rows are deleted and the
    /// new set (with freshly minted IDs) inserted. The condition is written
    /// in the same transaction because its target references are only valid
    /// against one generation of targets.
    pub async fn update_targets(
        &self,
        proxy_id: &str,
        targets: &[Target],
        condition: Option<&RouteCondition>,
        created_by: Option<&str>,
    ) -> Result<()> {
        let current = self.get_proxy(proxy_id).await?;

        if targets.is_empty() {
            return Err(Error::ValidationError(
                "at least one target is required".to_string(),
            ));
        }
        for target in targets {
            if target.weight < 0.0 {
                return Err(Error::ValidationError(format!(
                    "target {} has a negative weight",
                    target.url
                )));
            }
        }
        if let Some(condition) = condition {
            validate_condition_refs(condition, targets)?;
        }

        let previous_state = json!({
            "targets": current.targets,
            "condition": current.condition,
        });
        let new_state = json!({
            "targets": targets,
            "condition": condition,
        });

        let condition_json = condition
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| Error::Internal(format!("failed to encode condition: {e}")))?;

        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM targets WHERE proxy_id = $1")
            .bind(proxy_id)
            .execute(&mut *tx)
            .await?;

        for target in targets {
            sqlx::query(
                "INSERT INTO targets (id, proxy_id, url, weight, is_active) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&target.id)
            .bind(proxy_id)
            .bind(&target.url)
            .bind(target.weight)
            .bind(target.is_active)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE proxies SET condition = $1, updated_at = $2 WHERE id = $3")
            .bind(condition_json)
            .bind(Utc::now())
            .bind(proxy_id)
            .execute(&mut *tx)
            .await?;

        append_change(
            &mut tx,
            proxy_id,
            ChangeKind::TargetsUpdate,
            Some(previous_state),
            new_state,
            created_by,
        )
        .await?;

        tx.commit().await?;
        self.cache().invalidate(proxy_id).await
    }

    /// Update (or clear) the routing condition
    pub async fn update_condition(
        &self,
        proxy_id: &str,
        condition: Option<&RouteCondition>,
        created_by: Option<&str>,
    ) -> Result<()> {
        let current = self.get_proxy(proxy_id).await?;

        if let Some(condition) = condition {
            validate_condition_refs(condition, &current.targets)?;
        }

        let previous_state = json!({ "condition": current.condition });
        let new_state = json!({ "condition": condition });

        let condition_json = condition
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| Error::Internal(format!("failed to encode condition: {e}")))?;

        let mut tx = self.pool().begin().await?;

        sqlx::query("UPDATE proxies SET condition = $1, updated_at = $2 WHERE id = $3")
            .bind(condition_json)
            .bind(Utc::now())
            .bind(proxy_id)
            .execute(&mut *tx)
            .await?;

        append_change(
            &mut tx,
            proxy_id,
            ChangeKind::ConditionUpdate,
            Some(previous_state),
            new_state,
            created_by,
        )
        .await?;

        tx.commit().await?;
        self.cache().invalidate(proxy_id).await
    }

    /// Point the proxy's primary listen URL somewhere else, creating it when
    /// the proxy has none
    pub async fn update_proxy_url(
        &self,
        proxy_id: &str,
        listen_url: &str,
        path_key: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<()> {
        let current = self.get_proxy(proxy_id).await?;

        // A listen URL carries a path key exactly when the proxy runs in
        // path mode
        match (current.mode, path_key) {
            (ProxyMode::Path, None) => {
                return Err(Error::ValidationError(
                    "path-mode proxies require a path_key".to_string(),
                ));
            }
            (ProxyMode::Redirect, Some(_)) => {
                return Err(Error::ValidationError(
                    "path_key is only valid for path-mode proxies".to_string(),
                ));
            }
            _ => {}
        }

        let now = Utc::now();

        let mut tx = self.pool().begin().await?;

        match current.listen_urls.first() {
            Some(primary) => {
                let previous_state = json!({
                    "id": primary.id,
                    "listen_url": primary.listen_url,
                    "path_key": primary.path_key,
                });
                let new_state = json!({
                    "id": primary.id,
                    "listen_url": listen_url,
                    "path_key": path_key,
                });

                sqlx::query(
                    "UPDATE proxy_listen_urls \
                     SET listen_url = $1, path_key = $2, updated_at = $3 WHERE id = $4",
                )
                .bind(listen_url)
                .bind(path_key)
                .bind(now)
                .bind(&primary.id)
                .execute(&mut *tx)
                .await?;

                append_change(
                    &mut tx,
                    proxy_id,
                    ChangeKind::UrlUpdate,
                    Some(previous_state),
                    new_state,
                    created_by,
                )
                .await?;
            }
            None => {
                let url_id = Uuid::new_v4().to_string();
                let new_state = json!({
                    "id": url_id,
                    "listen_url": listen_url,
                    "path_key": path_key,
                });

                sqlx::query(
                    "INSERT INTO proxy_listen_urls \
                     (id, proxy_id, listen_url, path_key, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(&url_id)
                .bind(proxy_id)
                .bind(listen_url)
                .bind(path_key)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                append_change(
                    &mut tx,
                    proxy_id,
                    ChangeKind::UrlUpdate,
                    None,
                    new_state,
                    created_by,
                )
                .await?;
            }
        }

        sqlx::query("UPDATE proxies SET updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(proxy_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.cache().invalidate(proxy_id).await
    }

    /// Toggle the stickiness-cookie flag
    pub async fn update_saving_cookies(
        &self,
        proxy_id: &str,
        save_cookies: bool,
        created_by: Option<&str>,
    ) -> Result<()> {
        let current = self.get_proxy(proxy_id).await?;
        self.update_flag(
            proxy_id,
            "saving_cookies_flg",
            ChangeKind::CookiesUpdate,
            current.save_cookies,
            save_cookies,
            created_by,
        )
        .await
    }

    /// Toggle query forwarding
    pub async fn update_query_forwarding(
        &self,
        proxy_id: &str,
        forward_query: bool,
        created_by: Option<&str>,
    ) -> Result<()> {
        let current = self.get_proxy(proxy_id).await?;
        self.update_flag(
            proxy_id,
            "query_forwarding_flg",
            ChangeKind::QueryForwardingUpdate,
            current.forward_query,
            forward_query,
            created_by,
        )
        .await
    }

    /// Toggle cookie forwarding. Owns its column and its change kind,
    /// independent of query forwarding.
    pub async fn update_cookies_forwarding(
        &self,
        proxy_id: &str,
        forward_cookies: bool,
        created_by: Option<&str>,
    ) -> Result<()> {
        let current = self.get_proxy(proxy_id).await?;
        self.update_flag(
            proxy_id,
            "cookies_forwarding_flg",
            ChangeKind::CookiesForwardingUpdate,
            current.forward_cookies,
            forward_cookies,
            created_by,
        )
        .await
    }

    async fn update_flag(
        &self,
        proxy_id: &str,
        column: &'static str,
        kind: ChangeKind,
        previous: bool,
        new: bool,
        created_by: Option<&str>,
    ) -> Result<()> {
        let mut previous_state = serde_json::Map::new();
        previous_state.insert(column.to_string(), json!(previous));
        let mut new_state = serde_json::Map::new();
        new_state.insert(column.to_string(), json!(new));

        let mut tx = self.pool().begin().await?;

        // `column` is one of three fixed identifiers, never request data
        sqlx::query(&format!(
            "UPDATE proxies SET {column} = $1, updated_at = $2 WHERE id = $3"
        ))
        .bind(new)
        .bind(Utc::now())
        .bind(proxy_id)
        .execute(&mut *tx)
        .await?;

        append_change(
            &mut tx,
            proxy_id,
            kind,
            Some(serde_json::Value::Object(previous_state)),
            serde_json::Value::Object(new_state),
            created_by,
        )
        .await?;

        tx.commit().await?;
        self.cache().invalidate(proxy_id).await
    }

    /// Page through a proxy's change history, newest first
    pub async fn get_changes(
        &self,
        proxy_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ProxyChange>> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            "SELECT id, proxy_id, change_type, previous_state, new_state, created_at, created_by \
             FROM proxy_changes WHERE proxy_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(proxy_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

async fn append_change(
    tx: &mut Transaction<'_, Postgres>,
    proxy_id: &str,
    kind: ChangeKind,
    previous_state: Option<serde_json::Value>,
    new_state: serde_json::Value,
    created_by: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO proxy_changes \
         (id, proxy_id, change_type, previous_state, new_state, created_at, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(proxy_id)
    .bind(kind.as_str())
    .bind(previous_state)
    .bind(new_state)
    .bind(Utc::now())
    .bind(created_by)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn validate_condition_refs(condition: &RouteCondition, targets: &[Target]) -> Result<()> {
    condition.validate().map_err(Error::ValidationError)?;

    for referenced in condition.referenced_targets() {
        if !targets.iter().any(|t| t.id == referenced) {
            return Err(Error::ValidationError(format!(
                "condition references unknown target {referenced}"
            )));
        }
    }
    Ok(())
}
