//! Admin REST handlers
//!
//! CRUD over proxies, targets, conditions, tags, flags, change history, and
//! stats. Every mutation goes storage-first (transaction + journal + cache
//! invalidation), then refreshes the live supervisor, then answers.

mod auth;
mod health;
mod proxies;
mod stats;
mod tags;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};

use crate::{middleware, state::AppState};

/// The full admin router: public auth/health routes plus the guarded API
pub fn admin_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/proxies", get(proxies::list_proxies).post(proxies::create_proxy))
        .route(
            "/proxies/{id}",
            get(proxies::get_proxy).delete(proxies::delete_proxy),
        )
        .route("/proxies/{id}/changes", get(proxies::get_proxy_changes))
        .route("/proxies/{id}/history", get(proxies::get_proxy_changes))
        .route("/proxies/{id}/targets", put(proxies::update_targets))
        .route("/proxies/{id}/condition", put(proxies::update_condition))
        .route("/proxies/{id}/url", put(proxies::update_url))
        .route("/proxies/{id}/cookies", put(proxies::update_saving_cookies))
        .route(
            "/proxies/{id}/query-forwarding",
            put(proxies::update_query_forwarding),
        )
        .route(
            "/proxies/{id}/cookies-forwarding",
            put(proxies::update_cookies_forwarding),
        )
        .route("/proxies/{id}/tags", put(tags::update_proxy_tags))
        .route("/proxies/by-tags", get(tags::proxies_by_tags))
        .route("/tags", get(tags::all_tags))
        .route("/stats", get(stats::overview))
        .route("/stats/{proxy_id}", get(stats::proxy_stats))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_auth));

    let public = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/register", post(auth::register));

    Router::new()
        .route("/healthz", get(health::healthz))
        .nest("/api", public.merge(protected))
        .with_state(state)
}
