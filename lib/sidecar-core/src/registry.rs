//! Registry contract and an in-memory registry

use crate::{Node, Result, Service};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Something a sidecar can announce its service to.
///
/// Implementations key nodes on `Node::id`: registering the same descriptor
/// twice leaves one live entry, and deregistering an absent node succeeds.
/// A node registered with a `ttl` is dropped once it has not been registered
/// again for that long.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Announce every node of `service`, optionally expiring after `ttl`
    async fn register(&self, service: &Service, ttl: Option<Duration>) -> Result<()>;

    /// Withdraw every node of `service`
    async fn deregister(&self, service: &Service) -> Result<()>;
}

/// MemoryRegistry keeps services and their nodes in process memory
pub struct MemoryRegistry {
    // Map of service name to nodes keyed by node id
    services: Arc<RwLock<HashMap<String, ServiceEntry>>>,
    register_calls: AtomicUsize,
    deregister_calls: AtomicUsize,
}

#[derive(Clone, Debug, Default)]
struct ServiceEntry {
    version: Option<String>,
    nodes: HashMap<String, TrackedNode>,
}

// Node with its registration timestamp and TTL
#[derive(Clone, Debug)]
struct TrackedNode {
    node: Node,
    ttl: Option<Duration>,
    last_seen: Instant,
}

impl TrackedNode {
    fn is_live(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.last_seen) <= ttl,
            None => true,
        }
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            register_calls: AtomicUsize::new(0),
            deregister_calls: AtomicUsize::new(0),
        }
    }

    /// Get a service with all of its live nodes
    pub async fn get_service(&self, name: &str) -> Option<Service> {
        let now = Instant::now();
        let services = self.services.read().await;
        let entry = services.get(name)?;

        let mut nodes: Vec<Node> = entry
            .nodes
            .values()
            .filter(|tracked| tracked.is_live(now))
            .map(|tracked| tracked.node.clone())
            .collect();
        if nodes.is_empty() {
            return None;
        }
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        Some(Service {
            name: name.to_string(),
            version: entry.version.clone(),
            nodes,
        })
    }

    /// Number of live nodes for a service
    pub async fn node_count(&self, name: &str) -> usize {
        let now = Instant::now();
        let services = self.services.read().await;
        services
            .get(name)
            .map(|entry| entry.nodes.values().filter(|n| n.is_live(now)).count())
            .unwrap_or(0)
    }

    /// List the names of all services with at least one live node
    pub async fn list_services(&self) -> Vec<String> {
        let now = Instant::now();
        let services = self.services.read().await;
        let mut names: Vec<String> = services
            .iter()
            .filter(|(_, entry)| entry.nodes.values().any(|n| n.is_live(now)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drop nodes whose TTL has run out. Returns how many were dropped.
    pub async fn prune_expired(&self) -> usize {
        let mut services = self.services.write().await;
        prune(&mut services, Instant::now())
    }

    /// How many times `register` has been called
    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    /// How many times `deregister` has been called
    pub fn deregister_calls(&self) -> usize {
        self.deregister_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, service: &Service, ttl: Option<Duration>) -> Result<()> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);

        let now = Instant::now();
        let mut services = self.services.write().await;
        prune(&mut services, now);

        let entry = services.entry(service.name.clone()).or_default();
        entry.version = service.version.clone();
        for node in &service.nodes {
            // registering again refreshes the timestamp and TTL
            entry.nodes.insert(
                node.id.clone(),
                TrackedNode {
                    node: node.clone(),
                    ttl,
                    last_seen: now,
                },
            );
        }

        debug!("Registered service: {} ({} nodes)", service.name, entry.nodes.len());
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);

        let mut services = self.services.write().await;
        prune(&mut services, Instant::now());
        if let Some(entry) = services.get_mut(&service.name) {
            for id in service.node_ids() {
                entry.nodes.remove(id);
            }
            if entry.nodes.is_empty() {
                services.remove(&service.name);
            }
        }

        debug!("Deregistered service: {}", service.name);
        Ok(())
    }
}

fn prune(services: &mut HashMap<String, ServiceEntry>, now: Instant) -> usize {
    let mut pruned = 0;
    services.retain(|name, entry| {
        entry.nodes.retain(|id, tracked| {
            let live = tracked.is_live(now);
            if !live {
                debug!("Registry TTL expired for service {}, node {}", name, id);
                pruned += 1;
            }
            live
        });
        !entry.nodes.is_empty()
    });
    pruned
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_then_deregister_leaves_no_nodes() {
        let registry = MemoryRegistry::new();
        let service = Service::build("greeter", "127.0.0.1", 8080);

        registry.register(&service, None).await.unwrap();
        assert_eq!(registry.node_count("greeter").await, 1);

        registry.deregister(&service).await.unwrap();
        assert_eq!(registry.node_count("greeter").await, 0);
        assert!(registry.get_service("greeter").await.is_none());
    }

    #[tokio::test]
    async fn test_register_twice_keeps_one_entry() {
        let registry = MemoryRegistry::new();
        let service = Service::build("greeter", "127.0.0.1", 8080);

        registry.register(&service, None).await.unwrap();
        registry.register(&service, None).await.unwrap();

        assert_eq!(registry.node_count("greeter").await, 1);
        assert_eq!(registry.register_calls(), 2);
    }

    #[tokio::test]
    async fn test_deregister_absent_is_ok() {
        let registry = MemoryRegistry::new();
        let service = Service::build("greeter", "127.0.0.1", 8080);

        assert!(registry.deregister(&service).await.is_ok());
        assert_eq!(registry.deregister_calls(), 1);
    }

    #[tokio::test]
    async fn test_deregister_keeps_other_instances() {
        let registry = MemoryRegistry::new();
        let first = Service::build("greeter", "127.0.0.1", 8080);
        let second = Service::build("greeter", "127.0.0.1", 8081);

        registry.register(&first, None).await.unwrap();
        registry.register(&second, None).await.unwrap();
        assert_eq!(registry.node_count("greeter").await, 2);

        registry.deregister(&first).await.unwrap();
        let remaining = registry.get_service("greeter").await.unwrap();
        assert_eq!(remaining.nodes, second.nodes);
    }

    #[tokio::test]
    async fn test_list_services() {
        let registry = MemoryRegistry::new();
        registry
            .register(&Service::build("greeter", "127.0.0.1", 8080), None)
            .await
            .unwrap();
        registry
            .register(&Service::build("auth", "127.0.0.1", 9090), None)
            .await
            .unwrap();

        assert_eq!(registry.list_services().await, vec!["auth", "greeter"]);
    }

    #[tokio::test]
    async fn test_node_expires_after_ttl() {
        let registry = MemoryRegistry::new();
        let service = Service::build("greeter", "127.0.0.1", 8080);

        registry
            .register(&service, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(registry.node_count("greeter").await, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.node_count("greeter").await, 0);
        assert!(registry.get_service("greeter").await.is_none());
        assert!(registry.list_services().await.is_empty());
        assert_eq!(registry.prune_expired().await, 1);
    }

    #[tokio::test]
    async fn test_register_refreshes_ttl() {
        let registry = MemoryRegistry::new();
        let service = Service::build("greeter", "127.0.0.1", 8080);
        let ttl = Some(Duration::from_millis(300));

        registry.register(&service, ttl).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            registry.register(&service, ttl).await.unwrap();
        }

        assert_eq!(registry.node_count("greeter").await, 1);
        assert_eq!(registry.prune_expired().await, 0);
    }

    #[tokio::test]
    async fn test_node_without_ttl_never_expires() {
        let registry = MemoryRegistry::new();
        let forever = Service::build("greeter", "127.0.0.1", 8080);
        let brief = Service::build("greeter", "127.0.0.1", 8081);

        registry.register(&forever, None).await.unwrap();
        registry
            .register(&brief, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let live = registry.get_service("greeter").await.unwrap();
        assert_eq!(live.nodes, forever.nodes);
    }
}
