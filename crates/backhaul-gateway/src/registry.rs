//! Process-wide map from agent name to live tunnel.
//!
//! Read-mostly and highly concurrent; handed explicitly to everything that
//! routes requests rather than living in a global.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::tunnel::Tunnel;

/// Registry of live tunnels, keyed by agent name.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<DashMap<String, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a tunnel under its agent name. An existing registration for
    /// the same name is superseded and returned so the caller can close it;
    /// two tunnels never answer to one name.
    pub fn install(&self, tunnel: Arc<Tunnel>) -> Option<Arc<Tunnel>> {
        let replaced = self
            .tunnels
            .insert(tunnel.name().to_string(), tunnel.clone());

        if replaced.is_some() {
            info!(agent = %tunnel.name(), "superseded existing tunnel registration");
        } else {
            info!(agent = %tunnel.name(), "registered tunnel");
        }

        replaced
    }

    /// Look up the live tunnel for an agent name.
    pub fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(name).map(|entry| entry.value().clone())
    }

    /// Remove a registration, but only if it still belongs to the given
    /// tunnel instance. A superseded tunnel closing late must not evict
    /// the registration that replaced it.
    pub fn remove(&self, name: &str, instance: &str) -> bool {
        let removed = self
            .tunnels
            .remove_if(name, |_, tunnel| tunnel.instance() == instance)
            .is_some();

        if removed {
            debug!(agent = %name, "removed tunnel from registry");
        }

        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tunnels.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.tunnels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn tunnel(name: &str, registry: &TunnelRegistry) -> Arc<Tunnel> {
        let (tx, _rx) = mpsc::channel(8);
        // _rx dropped: dispatch would fail, but these tests only exercise
        // registry bookkeeping.
        Tunnel::new(name.to_string(), tx, registry.clone())
    }

    #[tokio::test]
    async fn test_install_and_get_are_isolated_per_name() {
        let registry = TunnelRegistry::new();
        let a = tunnel("a", &registry);
        let b = tunnel("b", &registry);

        registry.install(a.clone());
        registry.install(b.clone());

        assert_eq!(registry.count(), 2);
        assert_eq!(registry.get("a").unwrap().instance(), a.instance());
        assert_eq!(registry.get("b").unwrap().instance(), b.instance());
        assert!(registry.get("c").is_none());
    }

    #[tokio::test]
    async fn test_install_supersedes_same_name() {
        let registry = TunnelRegistry::new();
        let first = tunnel("a", &registry);
        let second = tunnel("a", &registry);

        assert!(registry.install(first.clone()).is_none());
        let replaced = registry.install(second.clone()).unwrap();
        assert_eq!(replaced.instance(), first.instance());

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("a").unwrap().instance(), second.instance());
    }

    #[tokio::test]
    async fn test_superseded_tunnel_close_does_not_evict_replacement() {
        let registry = TunnelRegistry::new();
        let first = tunnel("a", &registry);
        let second = tunnel("a", &registry);

        registry.install(first.clone());
        registry.install(second.clone());

        // The stale instance closing late must leave the live one in place
        first.close();
        assert!(registry.contains("a"));
        assert_eq!(registry.get("a").unwrap().instance(), second.instance());

        second.close();
        assert!(!registry.contains("a"));
    }
}
