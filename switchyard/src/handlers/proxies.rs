//! Proxy CRUD and per-proxy settings endpoints

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    middleware::Claims,
    models::{ConditionType, ListenUrl, Proxy, ProxyMode, RouteCondition, Target},
    state::AppState,
    storage::config_from,
};

const PATH_KEY_LEN: usize = 10;
const MAX_CHANGES_PAGE: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct TargetBody {
    pub url: String,
    pub weight: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Condition as submitted alongside new targets. Because replacement target
/// IDs are minted server-side, `values` keys and `default` reference targets
/// by their position in the submitted list ("0", "1", ...).
#[derive(Debug, Deserialize)]
pub struct IndexedConditionBody {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    #[serde(default)]
    pub param_name: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub expr: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListenUrlBody {
    pub listen_url: String,
    #[serde(default)]
    pub path_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProxyRequest {
    #[serde(default)]
    pub name: String,
    pub mode: ProxyMode,
    pub listen_urls: Vec<ListenUrlBody>,
    pub targets: Vec<TargetBody>,
    #[serde(default)]
    pub condition: Option<IndexedConditionBody>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub save_cookies: bool,
    #[serde(default)]
    pub forward_query: bool,
    #[serde(default)]
    pub forward_cookies: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTargetsRequest {
    pub targets: Vec<TargetBody>,
    #[serde(default)]
    pub condition: Option<IndexedConditionBody>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConditionRequest {
    /// References current target IDs directly; null clears the condition
    #[serde(default)]
    pub condition: Option<RouteCondition>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUrlRequest {
    pub listen_url: String,
    #[serde(default)]
    pub path_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSavingCookiesRequest {
    pub saving_cookies_flg: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQueryForwardingRequest {
    pub query_forwarding_flg: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCookiesForwardingRequest {
    pub cookies_forwarding_flg: bool,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

pub async fn list_proxies(State(state): State<AppState>) -> Result<Json<Vec<Proxy>>> {
    Ok(Json(state.storage.get_proxies().await?))
}

pub async fn get_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Proxy>> {
    Ok(Json(state.storage.get_proxy(&id).await?))
}

pub async fn create_proxy(
    State(state): State<AppState>,
    Json(body): Json<CreateProxyRequest>,
) -> Result<impl IntoResponse> {
    let proxy_id = Uuid::new_v4().to_string();
    let now = Utc::now();

    let targets = mint_targets(&proxy_id, &body.targets);
    let condition = body
        .condition
        .as_ref()
        .map(|c| resolve_indexed_condition(c, &targets))
        .transpose()?;

    let listen_urls = body
        .listen_urls
        .iter()
        .map(|lu| ListenUrl {
            id: Uuid::new_v4().to_string(),
            proxy_id: proxy_id.clone(),
            listen_url: lu.listen_url.clone(),
            // Path mode always carries a key; mint one when the operator
            // did not pick it
            path_key: match (&body.mode, &lu.path_key) {
                (ProxyMode::Path, Some(key)) if !key.is_empty() => Some(key.clone()),
                (ProxyMode::Path, _) => Some(random_path_key()),
                (ProxyMode::Redirect, _) => None,
            },
            created_at: now,
            updated_at: now,
        })
        .collect();

    let mut proxy = Proxy {
        id: proxy_id,
        name: body.name,
        mode: body.mode,
        listen_urls,
        targets,
        condition,
        tags: body.tags,
        save_cookies: body.save_cookies,
        forward_query: body.forward_query,
        forward_cookies: body.forward_cookies,
        created_at: now,
        updated_at: now,
    };

    // Reject configs the data plane would refuse, before anything persists
    crate::proxy::Proxy::new(config_from(proxy.clone()))?;

    state.storage.create_proxy(&mut proxy).await?;
    state.supervisor.create_proxy(config_from(proxy.clone()))?;

    Ok((StatusCode::CREATED, Json(proxy)))
}

pub async fn delete_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>> {
    state.storage.delete_proxy(&id).await?;
    state.supervisor.delete_proxy(&id).await;

    Ok(Json(MessageResponse {
        message: "proxy deleted",
    }))
}

pub async fn update_targets(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<UpdateTargetsRequest>,
) -> Result<Json<MessageResponse>> {
    let targets = mint_targets(&id, &body.targets);
    let condition = body
        .condition
        .as_ref()
        .map(|c| resolve_indexed_condition(c, &targets))
        .transpose()?;

    state
        .storage
        .update_targets(&id, &targets, condition.as_ref(), Some(&claims.sub))
        .await?;
    refresh_supervisor(&state, &id).await?;

    Ok(Json(MessageResponse {
        message: "proxy updated successfully",
    }))
}

pub async fn update_condition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<UpdateConditionRequest>,
) -> Result<Json<MessageResponse>> {
    state
        .storage
        .update_condition(&id, body.condition.as_ref(), Some(&claims.sub))
        .await?;
    refresh_supervisor(&state, &id).await?;

    Ok(Json(MessageResponse {
        message: "condition updated",
    }))
}

pub async fn update_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<UpdateUrlRequest>,
) -> Result<Json<MessageResponse>> {
    state
        .storage
        .update_proxy_url(
            &id,
            &body.listen_url,
            body.path_key.as_deref(),
            Some(&claims.sub),
        )
        .await?;
    refresh_supervisor(&state, &id).await?;

    Ok(Json(MessageResponse {
        message: "listen URL updated",
    }))
}

pub async fn update_saving_cookies(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<UpdateSavingCookiesRequest>,
) -> Result<Json<MessageResponse>> {
    state
        .storage
        .update_saving_cookies(&id, body.saving_cookies_flg, Some(&claims.sub))
        .await?;
    refresh_supervisor(&state, &id).await?;

    Ok(Json(MessageResponse {
        message: "cookie saving updated",
    }))
}

pub async fn update_query_forwarding(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<UpdateQueryForwardingRequest>,
) -> Result<Json<MessageResponse>> {
    state
        .storage
        .update_query_forwarding(&id, body.query_forwarding_flg, Some(&claims.sub))
        .await?;
    refresh_supervisor(&state, &id).await?;

    Ok(Json(MessageResponse {
        message: "query forwarding updated",
    }))
}

pub async fn update_cookies_forwarding(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<UpdateCookiesForwardingRequest>,
) -> Result<Json<MessageResponse>> {
    state
        .storage
        .update_cookies_forwarding(&id, body.cookies_forwarding_flg, Some(&claims.sub))
        .await?;
    refresh_supervisor(&state, &id).await?;

    Ok(Json(MessageResponse {
        message: "cookie forwarding updated",
    }))
}

pub async fn get_proxy_changes(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<impl IntoResponse> {
    let limit = page.limit.unwrap_or(50).clamp(1, MAX_CHANGES_PAGE);
    let offset = page.offset.unwrap_or(0).max(0);

    let changes = state.storage.get_changes(&id, limit, offset).await?;
    Ok(Json(json!({
        "proxy_id": id,
        "changes": changes,
        "limit": limit,
        "offset": offset,
    })))
}

/// Push the just-committed config into the live map
async fn refresh_supervisor(state: &AppState, proxy_id: &str) -> Result<()> {
    let config = state.storage.get_proxy_config(proxy_id).await?;
    state.supervisor.update_proxy(config).await
}

fn mint_targets(proxy_id: &str, bodies: &[TargetBody]) -> Vec<Target> {
    bodies
        .iter()
        .map(|body| Target {
            id: Uuid::new_v4().to_string(),
            proxy_id: proxy_id.to_string(),
            url: body.url.clone(),
            weight: body.weight,
            is_active: body.is_active,
        })
        .collect()
}

/// Translate positional target references into the minted IDs
fn resolve_indexed_condition(
    body: &IndexedConditionBody,
    targets: &[Target],
) -> Result<RouteCondition> {
    let lookup = |index: &str| -> Result<String> {
        let position: usize = index.parse().map_err(|_| {
            Error::ValidationError(format!("condition references non-numeric target index {index}"))
        })?;
        targets
            .get(position)
            .map(|t| t.id.clone())
            .ok_or_else(|| {
                Error::ValidationError(format!("condition references target index {index} out of range"))
            })
    };

    let mut values = BTreeMap::new();
    for (index, spec) in &body.values {
        values.insert(lookup(index)?, spec.clone());
    }

    let default = if body.default.is_empty() {
        String::new()
    } else {
        lookup(&body.default)?
    };

    let condition = RouteCondition {
        condition_type: body.condition_type,
        param_name: body.param_name.clone(),
        values,
        default,
        expr: body.expr.clone(),
    };
    condition.validate().map_err(Error::ValidationError)?;

    Ok(condition)
}

fn random_path_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PATH_KEY_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Vec<Target> {
        mint_targets(
            "p1",
            &[
                TargetBody {
                    url: "https://a.example.com/".to_string(),
                    weight: 0.5,
                    is_active: true,
                },
                TargetBody {
                    url: "https://b.example.com/".to_string(),
                    weight: 0.5,
                    is_active: true,
                },
            ],
        )
    }

    #[test]
    fn minted_targets_get_fresh_ids() {
        let targets = targets();
        assert_ne!(targets[0].id, targets[1].id);
        assert!(targets.iter().all(|t| t.proxy_id == "p1"));
    }

    #[test]
    fn indexed_condition_resolves_positions_to_ids() {
        let targets = targets();
        let body = IndexedConditionBody {
            condition_type: ConditionType::Header,
            param_name: "X-Variant".to_string(),
            values: [
                ("0".to_string(), "a".to_string()),
                ("1".to_string(), "b".to_string()),
            ]
            .into_iter()
            .collect(),
            default: "0".to_string(),
            expr: None,
        };

        let condition = resolve_indexed_condition(&body, &targets).unwrap();
        assert_eq!(condition.values.get(&targets[0].id), Some(&"a".to_string()));
        assert_eq!(condition.values.get(&targets[1].id), Some(&"b".to_string()));
        assert_eq!(condition.default, targets[0].id);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let targets = targets();
        let body = IndexedConditionBody {
            condition_type: ConditionType::Header,
            param_name: "X-Variant".to_string(),
            values: [("7".to_string(), "a".to_string())].into_iter().collect(),
            default: String::new(),
            expr: None,
        };
        assert!(resolve_indexed_condition(&body, &targets).is_err());
    }

    #[test]
    fn path_keys_are_random_and_sized() {
        let a = random_path_key();
        let b = random_path_key();
        assert_eq!(a.len(), PATH_KEY_LEN);
        assert_ne!(a, b);
    }
}
