//! Virtual-host multiplexer: the `host -> proxy` table at the front of the
//! data plane
//!
//! Lookups key on the host portion of the request (port stripped). A proxy in
//! `path` mode with a configured path key only admits paths under
//! `/<path_key>`; several proxies can share a host as long as their path keys
//! differ.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{listen_host, Proxy};

#[derive(Debug, Clone)]
struct HostEntry {
    proxy_id: String,
    path_key: Option<String>,
    proxy: Arc<Proxy>,
}

/// Concurrent host lookup table
#[derive(Debug, Default)]
pub struct VirtualHosts {
    table: RwLock<HashMap<String, Vec<HostEntry>>>,
}

impl VirtualHosts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install every listen surface of a proxy, replacing any entries the
    /// same proxy already holds on those hosts
    pub fn install(&self, proxy: &Arc<Proxy>) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        for listen_url in &proxy.listen_urls {
            let host = listen_host(&listen_url.listen_url).to_string();
            let entries = table.entry(host).or_default();
            entries.retain(|entry| entry.proxy_id != proxy.id);
            entries.push(HostEntry {
                proxy_id: proxy.id.clone(),
                path_key: listen_url.path_key.clone(),
                proxy: Arc::clone(proxy),
            });
        }
    }

    /// Remove one proxy's entry for a single host
    pub fn remove_host(&self, host: &str, proxy_id: &str) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = table.get_mut(host) {
            entries.retain(|entry| entry.proxy_id != proxy_id);
            if entries.is_empty() {
                table.remove(host);
            }
        }
    }

    /// Remove every entry a proxy holds
    pub fn remove_proxy(&self, proxy: &Proxy) {
        for host in proxy.hosts().map(str::to_string).collect::<Vec<_>>() {
            self.remove_host(&host, &proxy.id);
        }
    }

    /// Resolve an inbound (host, path) pair to a proxy
    pub fn resolve(&self, host: &str, path: &str) -> Option<Arc<Proxy>> {
        let host = host.split(':').next().unwrap_or(host);
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let entries = table.get(host)?;

        // Keyed entries are more specific and win over the bare host
        let keyed = entries.iter().find(|entry| {
            entry
                .path_key
                .as_deref()
                .is_some_and(|key| path_admitted(path, key))
        });
        if let Some(entry) = keyed {
            return Some(Arc::clone(&entry.proxy));
        }

        entries
            .iter()
            .find(|entry| entry.path_key.is_none())
            .map(|entry| Arc::clone(&entry.proxy))
    }
}

fn path_admitted(path: &str, path_key: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    match rest.strip_prefix(path_key) {
        Some(tail) => tail.is_empty() || tail.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{config, target};
    use super::super::ListenUrl;
    use super::*;
    use crate::models::ProxyMode;

    fn proxy_on(id: &str, listen_url: &str, path_key: Option<&str>) -> Arc<Proxy> {
        let mut cfg = config(id, vec![target("t1", 1.0, true)]);
        cfg.mode = if path_key.is_some() {
            ProxyMode::Path
        } else {
            ProxyMode::Redirect
        };
        cfg.listen_urls = vec![ListenUrl {
            id: format!("{id}-lu"),
            listen_url: listen_url.to_string(),
            path_key: path_key.map(str::to_string),
        }];
        Arc::new(Proxy::new(cfg).unwrap())
    }

    #[test]
    fn resolves_by_host_ignoring_request_port() {
        let vhosts = VirtualHosts::new();
        vhosts.install(&proxy_on("p1", "ab.example.com:8080", None));

        assert!(vhosts.resolve("ab.example.com", "/").is_some());
        assert!(vhosts.resolve("ab.example.com:9999", "/x").is_some());
        assert!(vhosts.resolve("other.example.com", "/").is_none());
    }

    #[test]
    fn path_key_gates_admission() {
        let vhosts = VirtualHosts::new();
        vhosts.install(&proxy_on("p1", "ab.example.com", Some("k7f2")));

        assert!(vhosts.resolve("ab.example.com", "/k7f2").is_some());
        assert!(vhosts.resolve("ab.example.com", "/k7f2/landing").is_some());
        assert!(vhosts.resolve("ab.example.com", "/k7f2extra").is_none());
        assert!(vhosts.resolve("ab.example.com", "/other").is_none());
    }

    #[test]
    fn keyed_entry_wins_over_bare_host() {
        let vhosts = VirtualHosts::new();
        vhosts.install(&proxy_on("bare", "ab.example.com", None));
        vhosts.install(&proxy_on("keyed", "ab.example.com", Some("k7f2")));

        assert_eq!(vhosts.resolve("ab.example.com", "/k7f2").unwrap().id, "keyed");
        assert_eq!(vhosts.resolve("ab.example.com", "/else").unwrap().id, "bare");
    }

    #[test]
    fn reinstall_replaces_and_remove_clears() {
        let vhosts = VirtualHosts::new();
        let first = proxy_on("p1", "ab.example.com", None);
        vhosts.install(&first);

        // Reinstalling the same proxy ID must not leave a duplicate entry
        let second = proxy_on("p1", "ab.example.com", None);
        vhosts.install(&second);
        let resolved = vhosts.resolve("ab.example.com", "/").unwrap();
        assert!(Arc::ptr_eq(&resolved, &second));

        vhosts.remove_proxy(&second);
        assert!(vhosts.resolve("ab.example.com", "/").is_none());
    }
}
