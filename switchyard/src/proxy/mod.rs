//! Data-plane proxy runtime
//!
//! A [`Proxy`] is an immutable, validated snapshot of one routing policy.
//! Reconfiguration never mutates a live instance: the supervisor builds a new
//! snapshot and swaps the `Arc`, so in-flight requests keep a consistent view.

pub mod expr;
pub mod handler;
pub mod redirect;
pub mod select;
pub mod stats;
pub mod vhost;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    models::{ProxyMode, RouteCondition},
};
use stats::ProxyStats;

const WEIGHT_EPSILON: f64 = 1e-9;

/// Runtime target: a flat owned copy without the persistence scoping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub url: String,
    pub weight: f64,
    pub is_active: bool,
}

/// Runtime listen surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenUrl {
    pub id: String,
    pub listen_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_key: Option<String>,
}

/// Everything needed to instantiate one proxy, as storage hands it out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub mode: ProxyMode,
    pub listen_urls: Vec<ListenUrl>,
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RouteCondition>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub save_cookies: bool,
    #[serde(default)]
    pub forward_query: bool,
    #[serde(default)]
    pub forward_cookies: bool,
}

/// One live routing policy
#[derive(Debug)]
pub struct Proxy {
    pub id: String,
    pub name: String,
    pub mode: ProxyMode,
    pub listen_urls: Vec<ListenUrl>,
    /// Weights normalized so active totals sum to 1 (or 0)
    pub targets: Vec<Target>,
    pub condition: Option<RouteCondition>,
    pub tags: Vec<String>,
    pub save_cookies: bool,
    pub forward_query: bool,
    pub forward_cookies: bool,
    cookie_name: String,
    stats: Arc<ProxyStats>,
}

impl Proxy {
    /// Validate a config and build a fresh instance
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let stats = Arc::new(ProxyStats::new(&config.id));
        Self::with_stats(config, stats)
    }

    /// Validate a config and build an instance that keeps accumulating into
    /// `stats`, used on reconfiguration so counters survive the swap.
    pub fn with_stats(mut config: ProxyConfig, stats: Arc<ProxyStats>) -> Result<Self> {
        let total_weight = validate(&config)?;

        if total_weight > WEIGHT_EPSILON && (total_weight - 1.0).abs() > WEIGHT_EPSILON {
            for target in &mut config.targets {
                target.weight /= total_weight;
            }
        }

        let cookie_name = format!("proxy_{}", config.id);

        Ok(Self {
            id: config.id,
            name: config.name,
            mode: config.mode,
            listen_urls: config.listen_urls,
            targets: config.targets,
            condition: config.condition,
            tags: config.tags,
            save_cookies: config.save_cookies,
            forward_query: config.forward_query,
            forward_cookies: config.forward_cookies,
            cookie_name,
            stats,
        })
    }

    /// Name of the stickiness cookie (`proxy_<id>`)
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Look up a target by ID, active targets only
    pub fn active_target(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id && t.is_active)
    }

    /// Host portion of every listen URL
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.listen_urls.iter().map(|lu| listen_host(&lu.listen_url))
    }
}

/// Host portion of a `host[:port][/path]` listen URL
pub fn listen_host(listen_url: &str) -> &str {
    let end = listen_url
        .find([':', '/'])
        .unwrap_or(listen_url.len());
    &listen_url[..end]
}

fn validate(config: &ProxyConfig) -> Result<f64> {
    if config.id.is_empty() {
        return Err(Error::InvalidProxy("proxy ID is required".to_string()));
    }
    if config.listen_urls.is_empty() {
        return Err(Error::InvalidProxy(
            "at least one listen URL is required".to_string(),
        ));
    }
    if config.targets.is_empty() {
        return Err(Error::InvalidProxy(
            "at least one target is required".to_string(),
        ));
    }

    let mut total_weight = 0.0;
    for target in &config.targets {
        if target.weight < 0.0 {
            return Err(Error::InvalidProxy(format!(
                "target {} has a negative weight",
                target.id
            )));
        }
        total_weight += target.weight;
    }

    if let Some(condition) = &config.condition {
        condition
            .validate()
            .map_err(Error::InvalidProxy)?;

        for referenced in condition.referenced_targets() {
            if !config.targets.iter().any(|t| t.id == referenced) {
                return Err(Error::InvalidProxy(format!(
                    "condition references unknown target {referenced}"
                )));
            }
        }
    }

    Ok(total_weight)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn target(id: &str, weight: f64, active: bool) -> Target {
        Target {
            id: id.to_string(),
            url: format!("https://{id}.example.com/"),
            weight,
            is_active: active,
        }
    }

    pub fn config(id: &str, targets: Vec<Target>) -> ProxyConfig {
        ProxyConfig {
            id: id.to_string(),
            name: format!("proxy {id}"),
            mode: ProxyMode::Redirect,
            listen_urls: vec![ListenUrl {
                id: format!("{id}-lu"),
                listen_url: "ab.example.com".to_string(),
                path_key: None,
            }],
            targets,
            condition: None,
            tags: Vec::new(),
            save_cookies: false,
            forward_query: false,
            forward_cookies: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::testing::{config, target};
    use super::*;
    use crate::models::ConditionType;

    #[test]
    fn rejects_empty_configs() {
        assert!(Proxy::new(config("", vec![target("a", 1.0, true)])).is_err());
        assert!(Proxy::new(config("p1", Vec::new())).is_err());

        let mut no_urls = config("p1", vec![target("a", 1.0, true)]);
        no_urls.listen_urls.clear();
        assert!(Proxy::new(no_urls).is_err());
    }

    #[test]
    fn rejects_negative_weight() {
        assert!(Proxy::new(config("p1", vec![target("a", -0.5, true)])).is_err());
    }

    #[test]
    fn normalizes_weights_to_one() {
        let proxy = Proxy::new(config(
            "p1",
            vec![target("a", 2.0, true), target("b", 6.0, true)],
        ))
        .unwrap();

        let total: f64 = proxy.targets.iter().map(|t| t.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((proxy.targets[0].weight - 0.25).abs() < 1e-9);
        assert!((proxy.targets[1].weight - 0.75).abs() < 1e-9);
    }

    #[test]
    fn keeps_zero_total_weight() {
        let proxy = Proxy::new(config(
            "p1",
            vec![target("a", 0.0, true), target("b", 0.0, true)],
        ))
        .unwrap();
        assert!(proxy.targets.iter().all(|t| t.weight == 0.0));
    }

    #[test]
    fn rejects_condition_referencing_unknown_target() {
        let mut cfg = config("p1", vec![target("a", 1.0, true)]);
        let mut values = BTreeMap::new();
        values.insert("ghost".to_string(), "x".to_string());
        cfg.condition = Some(RouteCondition {
            condition_type: ConditionType::Header,
            param_name: "X-Variant".to_string(),
            values,
            default: "a".to_string(),
            expr: None,
        });
        assert!(Proxy::new(cfg).is_err());
    }

    #[test]
    fn listen_host_strips_port_and_path() {
        assert_eq!(listen_host("ab.example.com"), "ab.example.com");
        assert_eq!(listen_host("ab.example.com:8080"), "ab.example.com");
        assert_eq!(listen_host("ab.example.com/landing"), "ab.example.com");
        assert_eq!(listen_host("ab.example.com:80/landing"), "ab.example.com");
    }

    #[test]
    fn active_target_ignores_inactive() {
        let proxy = Proxy::new(config(
            "p1",
            vec![target("a", 1.0, true), target("b", 1.0, false)],
        ))
        .unwrap();
        assert!(proxy.active_target("a").is_some());
        assert!(proxy.active_target("b").is_none());
    }
}
