//! Hostname canonicalisation.
//!
//! Servers get contacted under whatever name an operator or a master pointer
//! happens to carry; the record keeps the canonical name the server itself
//! reports. The resolver caches the mapping and persists it through the store
//! so every later reference is rewritten the same way.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::store::InstanceStore;
use crate::TopologyError;

pub struct HostnameResolver {
    store: Arc<InstanceStore>,
    cache: RwLock<HashMap<String, String>>,
}

impl HostnameResolver {
    pub fn new(store: Arc<InstanceStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Prime the cache from the store's persisted mapping.
    pub async fn load(&self) -> Result<(), TopologyError> {
        let persisted = self.store.hostname_resolve_map().await?;
        let mut cache = self.cache.write();
        for (hostname, resolved) in persisted {
            cache.insert(hostname, resolved);
        }
        Ok(())
    }

    /// Canonical form of a hostname. Unmapped names canonicalise to
    /// themselves; the mapping itself is idempotent.
    pub fn resolve(&self, hostname: &str) -> String {
        self.cache
            .read()
            .get(hostname)
            .cloned()
            .unwrap_or_else(|| hostname.to_string())
    }

    /// Record a mapping in the cache only. Used mid-probe, where store writes
    /// are deferred until the topology gate is released.
    pub fn cache_resolved_hostname(&self, hostname: &str, resolved: &str) {
        let mut cache = self.cache.write();
        cache.insert(hostname.to_string(), resolved.to_string());
        // The canonical name must canonicalise to itself.
        cache.insert(resolved.to_string(), resolved.to_string());
    }

    /// Record that `hostname` is canonically known as `resolved`, as reported
    /// by the server's own `@@hostname`, and persist the mapping. Last writer
    /// wins.
    pub async fn update_resolved_hostname(
        &self,
        hostname: &str,
        resolved: &str,
    ) -> Result<(), TopologyError> {
        self.cache_resolved_hostname(hostname, resolved);
        if let Err(e) = self.store.write_hostname_resolve(hostname, resolved).await {
            warn!("failed to persist hostname mapping {hostname} -> {resolved}: {e}");
            return Err(e);
        }
        Ok(())
    }

    /// The current in-memory mapping.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.cache.read().clone()
    }
}
