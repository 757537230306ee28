//! Persistent data model shared by storage, the supervisor, and the admin API

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a proxy exposes its listen surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Plain host-based redirect
    Redirect,
    /// Host plus obfuscating path key
    Path,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Redirect => "redirect",
            ProxyMode::Path => "path",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "redirect" => Some(ProxyMode::Redirect),
            "path" => Some(ProxyMode::Path),
            _ => None,
        }
    }
}

/// Kind of routing condition attached to a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Header,
    Query,
    Cookie,
    UserAgent,
    Language,
    Expr,
}

/// Routing condition.
///
/// `values` maps target IDs to match specs: a literal value for the
/// lookup-style types, a boolean expression source for [`ConditionType::Expr`].
/// A `BTreeMap` keeps evaluation order lexicographic by target ID so every
/// replica resolves the same entry first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Parameter name for header/query/cookie, `platform`/`browser` for
    /// user-agent conditions; unused for language and expr
    #[serde(default)]
    pub param_name: String,

    /// target ID -> match spec
    #[serde(default)]
    pub values: BTreeMap<String, String>,

    /// Fallback target ID when nothing matches
    #[serde(default)]
    pub default: String,

    /// Single expression evaluating directly to a target ID (expr type only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

impl RouteCondition {
    /// Structural validation, independent of any target list
    pub fn validate(&self) -> Result<(), String> {
        match self.condition_type {
            ConditionType::Expr => {
                let has_expr = self.expr.as_deref().is_some_and(|e| !e.is_empty());
                if !has_expr && self.values.is_empty() {
                    return Err(
                        "expr condition requires either an expression or per-target expressions"
                            .to_string(),
                    );
                }
            }
            _ => {
                if self.param_name.is_empty() {
                    return Err("param_name is required for non-expr conditions".to_string());
                }
                if self.values.is_empty() {
                    return Err("values are required for non-expr conditions".to_string());
                }
            }
        }
        Ok(())
    }

    /// Every target ID the condition references
    pub fn referenced_targets(&self) -> impl Iterator<Item = &str> {
        self.values
            .keys()
            .map(String::as_str)
            .chain((!self.default.is_empty()).then_some(self.default.as_str()))
    }
}

/// One destination URL with its traffic weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub proxy_id: String,
    pub url: String,
    pub weight: f64,
    pub is_active: bool,
}

/// A host[:port][/path] surface the proxy accepts traffic on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenUrl {
    pub id: String,
    pub proxy_id: String,
    pub listen_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full persistent proxy record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    pub name: String,
    pub mode: ProxyMode,
    pub listen_urls: Vec<ListenUrl>,
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RouteCondition>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub save_cookies: bool,
    pub forward_query: bool,
    pub forward_cookies: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of mutation recorded in the change journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    TargetsUpdate,
    ConditionUpdate,
    UrlUpdate,
    CookiesUpdate,
    QueryForwardingUpdate,
    CookiesForwardingUpdate,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::TargetsUpdate => "targets_update",
            ChangeKind::ConditionUpdate => "condition_update",
            ChangeKind::UrlUpdate => "url_update",
            ChangeKind::CookiesUpdate => "cookies_update",
            ChangeKind::QueryForwardingUpdate => "query_forwarding_update",
            ChangeKind::CookiesForwardingUpdate => "cookies_forwarding_update",
        }
    }
}

/// One row of the append-only change journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyChange {
    pub id: String,
    pub proxy_id: String,
    pub change_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<serde_json::Value>,
    pub new_state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// Admin user (auth boundary)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A single recorded click, as the downstream consumer persists it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visit {
    pub id: String,
    pub proxy_id: String,
    pub target_id: String,
    pub user_id: String,
    pub rid: String,
    pub rrid: String,
    pub ruid: String,
    pub created_at: DateTime<Utc>,
}
