//! Node records
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One running instance of a service as seen by the registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    /// `host:port` form of the node address
    pub fn host_port(&self) -> String {
        if self.address.contains(':') {
            // bare IPv6 literal
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}
