//! Tag endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::{error::Result, models::Proxy, state::AppState};

#[derive(Debug, Deserialize)]
pub struct UpdateTagsRequest {
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TagsQuery {
    /// Comma-separated tag list
    pub tags: String,
}

pub async fn all_tags(State(state): State<AppState>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.storage.get_all_tags().await?))
}

pub async fn update_proxy_tags(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateTagsRequest>,
) -> Result<Json<Vec<String>>> {
    state.storage.update_tags(&id, &body.tags).await?;
    Ok(Json(state.storage.get_tags(&id).await?))
}

pub async fn proxies_by_tags(
    State(state): State<AppState>,
    Query(query): Query<TagsQuery>,
) -> Result<Json<Vec<Proxy>>> {
    let tags: Vec<String> = query
        .tags
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    let ids = state.storage.proxy_ids_by_tags(&tags).await?;

    let mut proxies = Vec::with_capacity(ids.len());
    for id in ids {
        proxies.push(state.storage.get_proxy(&id).await?);
    }

    Ok(Json(proxies))
}
