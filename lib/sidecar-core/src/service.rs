//! Service descriptors
//!
//! A [`Service`] is built once when the sidecar starts. The same value is the
//! body of the register call and, unchanged, of the deregister call, so the
//! registry can match the pair by node id.

use crate::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A named service together with the node(s) announcing it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub nodes: Vec<Node>,
}

impl Service {
    /// Describe this process as a single node of `name` reachable on
    /// `address:port`.
    ///
    /// The node id is `name` followed by a freshly generated UUID, so two
    /// instances (or two runs of the same instance) never share an id.
    pub fn build(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let id = format!("{}-{}", name, Uuid::new_v4());

        Self {
            name,
            version: None,
            nodes: vec![Node {
                id,
                address: address.into(),
                port,
                metadata: BTreeMap::new(),
            }],
        }
    }

    /// Set the service version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Attach a metadata entry to every node
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        for node in &mut self.nodes {
            node.metadata.insert(key.clone(), value.clone());
        }
        self
    }

    /// Ids of all nodes in this descriptor
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_single_node() {
        let service = Service::build("greeter", "127.0.0.1", 8080);
        assert_eq!(service.name, "greeter");
        assert_eq!(service.nodes.len(), 1);

        let node = &service.nodes[0];
        assert_eq!(node.address, "127.0.0.1");
        assert_eq!(node.port, 8080);
        assert!(node.metadata.is_empty());
    }

    #[test]
    fn test_node_id_is_name_and_uuid() {
        let service = Service::build("greeter", "127.0.0.1", 8080);
        let id = &service.nodes[0].id;
        let suffix = id.strip_prefix("greeter-").expect("id starts with service name");
        assert!(Uuid::parse_str(suffix).is_ok());
    }

    #[test]
    fn test_node_ids_are_unique() {
        let a = Service::build("greeter", "127.0.0.1", 8080);
        let b = Service::build("greeter", "127.0.0.1", 8080);
        assert_ne!(a.nodes[0].id, b.nodes[0].id);
    }

    #[test]
    fn test_wire_body() {
        let service = Service::build("greeter", "127.0.0.1", 8080);
        let id = service.nodes[0].id.clone();
        let json = serde_json::to_value(&service).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "greeter",
                "nodes": [{"id": id, "address": "127.0.0.1", "port": 8080}]
            })
        );
    }

    #[test]
    fn test_version_and_metadata() {
        let service = Service::build("greeter", "10.0.0.2", 9000)
            .with_version("1.2.0")
            .with_metadata("protocol", "jsonrpc");

        assert_eq!(service.version.as_deref(), Some("1.2.0"));
        assert_eq!(
            service.nodes[0].metadata.get("protocol").map(String::as_str),
            Some("jsonrpc")
        );

        let json = serde_json::to_value(&service).unwrap();
        assert_eq!(json["version"], "1.2.0");
        assert_eq!(json["nodes"][0]["metadata"]["protocol"], "jsonrpc");
    }

    #[test]
    fn test_deserialize_minimal_body() {
        let body = r#"{"name":"greeter",
            "nodes":[{"id":"greeter-abc","address":"127.0.0.1","port":8080}]}"#;
        let service: Service = serde_json::from_str(body).unwrap();
        assert_eq!(service.node_ids().collect::<Vec<_>>(), vec!["greeter-abc"]);
        assert_eq!(service.version, None);
    }
}
