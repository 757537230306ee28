//! Control-plane supervisor: owns the live proxy map and applies
//! reconfigurations
//!
//! The map holds immutable [`Proxy`] snapshots behind `Arc`s. Request threads
//! resolve and clone an `Arc` without ever holding a lock across the
//! selection; a reconfiguration builds a fresh snapshot and swaps the map
//! entry, so in-flight requests finish against the instance they started
//! with. Counters carry over to the new instance.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    proxy::{vhost::VirtualHosts, Proxy, ProxyConfig},
    pubsub::ChangeNotifier,
};

/// Where the supervisor pulls fresh proxy configs from
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch one proxy's config; `Error::NotFound` when it no longer exists
    async fn proxy_config(&self, proxy_id: &str) -> Result<ProxyConfig>;

    /// Fetch every proxy config (cold start)
    async fn proxy_configs(&self) -> Result<Vec<ProxyConfig>>;
}

/// Live policy map plus the virtual-host table it drives
pub struct Supervisor {
    proxies: RwLock<HashMap<String, Arc<Proxy>>>,
    vhosts: VirtualHosts,
    store: Arc<dyn ConfigSource>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn ConfigSource>, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self {
            proxies: RwLock::new(HashMap::new()),
            vhosts: VirtualHosts::new(),
            store,
            notifier,
        }
    }

    /// Install every proxy found in storage. Individual failures are logged
    /// and skipped so one broken config cannot keep the gateway down.
    pub async fn bootstrap(&self) -> Result<()> {
        let configs = self.store.proxy_configs().await?;
        let total = configs.len();
        let mut installed = 0;

        for config in configs {
            let proxy_id = config.id.clone();
            match self.create_proxy(config) {
                Ok(_) => installed += 1,
                Err(e) => {
                    tracing::error!(%proxy_id, "skipping proxy at startup: {}", e);
                }
            }
        }

        tracing::info!("installed {installed}/{total} proxies");
        Ok(())
    }

    /// Instantiate a new proxy and make it routable
    pub fn create_proxy(&self, config: ProxyConfig) -> Result<Arc<Proxy>> {
        let proxy = Arc::new(Proxy::new(config)?);

        let mut proxies = self.proxies.write().unwrap_or_else(|e| e.into_inner());
        self.vhosts.install(&proxy);
        proxies.insert(proxy.id.clone(), Arc::clone(&proxy));

        Ok(proxy)
    }

    /// Swap a proxy to a new config and notify peers
    pub async fn update_proxy(&self, config: ProxyConfig) -> Result<()> {
        let proxy_id = config.id.clone();
        self.apply_config(config)?;

        // Best effort: a lost notice degrades peers to
        // consistent-on-next-change, never this replica
        if let Err(e) = self.notifier.publish_settings_change(&proxy_id).await {
            tracing::warn!(%proxy_id, "failed to publish settings change: {}", e);
        }

        Ok(())
    }

    /// Remove a proxy from the data plane and notify peers
    pub async fn delete_proxy(&self, proxy_id: &str) {
        let removed = {
            let mut proxies = self.proxies.write().unwrap_or_else(|e| e.into_inner());
            proxies.remove(proxy_id)
        };

        if let Some(proxy) = removed {
            self.vhosts.remove_proxy(&proxy);
        }

        if let Err(e) = self.notifier.publish_settings_change(proxy_id).await {
            tracing::warn!(%proxy_id, "failed to publish settings change: {}", e);
        }
    }

    /// React to a peer's change notice: refresh the config from storage.
    ///
    /// Notices for proxies this replica does not hold are ignored; they are
    /// picked up by the next cold start. A notice for a proxy that is gone
    /// from storage removes it locally. Peer-driven refreshes do not
    /// republish, the originating replica already did.
    pub async fn handle_proxy_update(&self, proxy_id: &str) -> Result<()> {
        if self.get(proxy_id).is_none() {
            tracing::debug!(proxy_id, "ignoring change notice for unknown proxy");
            return Ok(());
        }

        match self.store.proxy_config(proxy_id).await {
            Ok(config) => self.apply_config(config),
            Err(Error::NotFound(_)) => {
                let removed = {
                    let mut proxies =
                        self.proxies.write().unwrap_or_else(|e| e.into_inner());
                    proxies.remove(proxy_id)
                };
                if let Some(proxy) = removed {
                    self.vhosts.remove_proxy(&proxy);
                    tracing::info!(proxy_id, "removed proxy deleted on a peer");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Build the new snapshot and atomically replace the old one
    fn apply_config(&self, config: ProxyConfig) -> Result<()> {
        let mut proxies = self.proxies.write().unwrap_or_else(|e| e.into_inner());

        let Some(old) = proxies.get(&config.id).cloned() else {
            return Err(Error::NotFound(format!("proxy {}", config.id)));
        };

        // Counters survive the swap
        let proxy = Arc::new(Proxy::with_stats(config, Arc::clone(old.stats()))?);

        let old_hosts: HashSet<String> = old.hosts().map(str::to_string).collect();
        let new_hosts: HashSet<String> = proxy.hosts().map(str::to_string).collect();

        for host in old_hosts.difference(&new_hosts) {
            self.vhosts.remove_host(host, &old.id);
        }
        self.vhosts.install(&proxy);

        proxies.insert(proxy.id.clone(), proxy);
        Ok(())
    }

    /// Live instance by ID
    pub fn get(&self, proxy_id: &str) -> Option<Arc<Proxy>> {
        let proxies = self.proxies.read().unwrap_or_else(|e| e.into_inner());
        proxies.get(proxy_id).cloned()
    }

    /// Every live instance (stats flusher)
    pub fn instances(&self) -> Vec<Arc<Proxy>> {
        let proxies = self.proxies.read().unwrap_or_else(|e| e.into_inner());
        proxies.values().cloned().collect()
    }

    /// Resolve an inbound request to a proxy
    pub fn resolve(&self, host: &str, path: &str) -> Option<Arc<Proxy>> {
        self.vhosts.resolve(host, path)
    }
}
