//! Target selection pipeline
//!
//! Resolution order: sticky cookie, then the routing condition, then the
//! weighted random draw. A proxy with a condition never falls through to the
//! weighted draw unless the caller opts in; a condition that resolves nothing
//! is a selection failure.

use rand::Rng;
use thiserror::Error;

use super::expr::{self, RequestEnv};
use super::{Proxy, Target};
use crate::models::{ConditionType, RouteCondition};

/// Selection failure, surfaced to the client as a 500
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no matching target found")]
    NoMatchingTarget,

    #[error("no active targets available")]
    NoActiveTargets,
}

/// Pick one active target for this request
pub fn select_target<'a>(
    proxy: &'a Proxy,
    env: &RequestEnv,
    weighted_fallback: bool,
) -> Result<&'a Target, SelectError> {
    // Stickiness first: an earlier selection pinned this client
    if let Some(sticky) = env.cookies.get(proxy.cookie_name()) {
        if let Some(target) = proxy.active_target(sticky) {
            return Ok(target);
        }
    }

    if let Some(condition) = &proxy.condition {
        if let Some(target) = by_condition(proxy, condition, env) {
            return Ok(target);
        }
        if !weighted_fallback {
            return Err(SelectError::NoMatchingTarget);
        }
    }

    weighted_random(proxy)
}

fn by_condition<'a>(
    proxy: &'a Proxy,
    condition: &RouteCondition,
    env: &RequestEnv,
) -> Option<&'a Target> {
    if condition.condition_type == ConditionType::Expr {
        return by_expr(proxy, condition, env);
    }

    let observed = match condition.condition_type {
        ConditionType::Header => env
            .headers
            .get(&condition.param_name.to_lowercase())
            .cloned()
            .unwrap_or_default(),
        ConditionType::Query => env
            .query
            .get(&condition.param_name)
            .cloned()
            .unwrap_or_default(),
        ConditionType::Cookie => env
            .cookies
            .get(&condition.param_name)
            .cloned()
            .unwrap_or_default(),
        ConditionType::UserAgent => {
            let ua = env.headers.get("user-agent").map(String::as_str).unwrap_or("");
            match condition.param_name.as_str() {
                "platform" => detect_platform(ua).to_string(),
                "browser" => detect_browser(ua).to_string(),
                other => {
                    tracing::warn!(
                        proxy_id = %proxy.id,
                        "unknown user-agent parameter '{}', using default target",
                        other
                    );
                    return default_target(proxy, condition);
                }
            }
        }
        ConditionType::Language => {
            let accept = env
                .headers
                .get("accept-language")
                .map(String::as_str)
                .unwrap_or("");
            parse_accept_language(accept)
        }
        ConditionType::Expr => unreachable!(),
    };

    // First match in lexicographic target-ID order wins, so concurrent
    // evaluators agree when two targets share a match spec
    let matched = condition
        .values
        .iter()
        .find(|(_, spec)| **spec == observed)
        .map(|(target_id, _)| target_id);

    if let Some(target_id) = matched {
        if let Some(target) = proxy.active_target(target_id) {
            return Some(target);
        }
        tracing::warn!(
            proxy_id = %proxy.id,
            target_id = %target_id,
            "condition matched an inactive or missing target, using default"
        );
    }

    default_target(proxy, condition)
}

fn by_expr<'a>(
    proxy: &'a Proxy,
    condition: &RouteCondition,
    env: &RequestEnv,
) -> Option<&'a Target> {
    if let Some(source) = condition.expr.as_deref().filter(|e| !e.is_empty()) {
        match expr::eval_string(source, env) {
            Ok(target_id) => {
                if let Some(target) = proxy.active_target(&target_id) {
                    return Some(target);
                }
                tracing::warn!(
                    proxy_id = %proxy.id,
                    target_id = %target_id,
                    "expression resolved to an inactive or missing target"
                );
            }
            Err(e) => {
                tracing::warn!(proxy_id = %proxy.id, "expression failed: {}", e);
            }
        }
        return default_target(proxy, condition);
    }

    // Per-target boolean expressions, lexicographic by target ID: the first
    // that evaluates to true wins
    for (target_id, source) in &condition.values {
        match expr::eval_bool(source, env) {
            Ok(true) => {
                if let Some(target) = proxy.active_target(target_id) {
                    return Some(target);
                }
                tracing::warn!(
                    proxy_id = %proxy.id,
                    target_id = %target_id,
                    "expression matched an inactive or missing target, using default"
                );
                return default_target(proxy, condition);
            }
            Ok(false) => {}
            Err(e) => {
                // A broken rule is skipped, never fatal
                tracing::warn!(
                    proxy_id = %proxy.id,
                    target_id = %target_id,
                    "skipping rule with failing expression: {}",
                    e
                );
            }
        }
    }

    default_target(proxy, condition)
}

fn default_target<'a>(proxy: &'a Proxy, condition: &RouteCondition) -> Option<&'a Target> {
    if condition.default.is_empty() {
        return None;
    }
    let target = proxy.active_target(&condition.default);
    if target.is_none() {
        tracing::warn!(
            proxy_id = %proxy.id,
            target_id = %condition.default,
            "default target is inactive or missing"
        );
    }
    target
}

fn weighted_random(proxy: &Proxy) -> Result<&Target, SelectError> {
    let active: Vec<&Target> = proxy.targets.iter().filter(|t| t.is_active).collect();
    if active.is_empty() {
        return Err(SelectError::NoActiveTargets);
    }

    let total_weight: f64 = active.iter().map(|t| t.weight).sum();
    if total_weight <= 0.0 {
        return Ok(active[0]);
    }

    let draw = rand::thread_rng().gen::<f64>() * total_weight;
    let mut cumulative = 0.0;
    for target in &active {
        cumulative += target.weight;
        if cumulative >= draw {
            return Ok(target);
        }
    }

    // Round-off left the draw above every cumulative step
    Ok(active[0])
}

/// `mobile` or `desktop`, scanning for the fixed keyword list
pub fn detect_platform(user_agent: &str) -> &'static str {
    const MOBILE_KEYWORDS: [&str; 8] = [
        "mobile",
        "android",
        "iphone",
        "ipad",
        "ipod",
        "windows phone",
        "blackberry",
        "opera mini",
    ];

    let ua = user_agent.to_lowercase();
    if MOBILE_KEYWORDS.iter().any(|kw| ua.contains(kw)) {
        "mobile"
    } else {
        "desktop"
    }
}

/// Browser tag in a fixed priority order. Chrome UAs also contain "safari",
/// so the order is load-bearing.
pub fn detect_browser(user_agent: &str) -> &'static str {
    const BROWSERS: [(&str, &str); 7] = [
        ("firefox", "firefox"),
        ("chrome", "chrome"),
        ("safari", "safari"),
        ("edge", "edge"),
        ("opera", "opera"),
        ("msie", "ie"),
        ("trident/7", "ie"),
    ];

    let ua = user_agent.to_lowercase();
    for (keyword, browser) in BROWSERS {
        if ua.contains(keyword) {
            return browser;
        }
    }
    "other"
}

/// Most-preferred language from an `Accept-Language` header value
pub fn parse_accept_language(accept_language: &str) -> String {
    let Some(first) = accept_language.split(',').next() else {
        return String::new();
    };
    first
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}
