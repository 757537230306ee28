//! Stats read endpoints, backed by the `visits` table the downstream
//! consumer fills

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{error::Result, state::AppState};

const DEFAULT_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct StatsWindowQuery {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

pub async fn overview(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let rows = state.storage.proxy_visit_stats().await?;
    Ok(Json(json!({ "proxies": rows })))
}

pub async fn proxy_stats(
    State(state): State<AppState>,
    Path(proxy_id): Path<String>,
    Query(window): Query<StatsWindowQuery>,
) -> Result<Json<serde_json::Value>> {
    let to = window.to.unwrap_or_else(Utc::now);
    let from = window
        .from
        .unwrap_or_else(|| to - Duration::days(DEFAULT_WINDOW_DAYS));

    let rows = state.storage.target_visit_stats(&proxy_id, from, to).await?;

    Ok(Json(json!({
        "proxy_id": proxy_id,
        "from": from,
        "to": to,
        "targets": rows,
    })))
}
