//! Startup state for the control plane.
//!
//! Tenant administration (the REST surface that normally writes nodes
//! and policies) is a separate service; this binary loads the durable
//! half of its output from a JSON document instead.

use std::path::Path;

use ipnet::Ipv4Net;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::flatten::PolicyDoc;
use crate::registry::Node;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("cannot read seed file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed seed file: {0}")]
    Parse(#[from] serde_json::Error),
}

fn default_bandwidth() -> u64 {
    100
}

fn default_block() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSeed {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub client_cidr: Ipv4Net,
    #[serde(default = "default_bandwidth")]
    pub max_bandwidth_mbps: u64,
}

impl NodeSeed {
    pub fn into_node(self) -> Node {
        Node {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            hostname: String::new(),
            auth_token: None,
            device_hash: None,
            client_version: String::new(),
            client_cidr: self.client_cidr,
            max_bandwidth_mbps: self.max_bandwidth_mbps,
            last_seen_at: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantPolicies {
    pub tenant_id: String,
    #[serde(default = "default_block")]
    pub default_block: bool,
    pub policies: Vec<PolicyDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedFile {
    /// Identity-service public key served to gateways. A dev keypair is
    /// generated when absent.
    #[serde(default)]
    pub public_key_pem: Option<String>,
    pub nodes: Vec<NodeSeed>,
    #[serde(default)]
    pub policies: Vec<TenantPolicies>,
}

pub fn load(path: &Path) -> Result<SeedFile, SeedError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_seed() {
        let raw = r#"{
            "nodes": [{
                "id": "7b6c2c1e-56f2-4f86-9b9b-0d6a2df3b111",
                "tenant_id": "T1",
                "name": "edge-1",
                "client_cidr": "10.8.0.0/24"
            }],
            "policies": [{
                "tenant_id": "T1",
                "policies": [{
                    "name": "devs-to-erp",
                    "priority": 100,
                    "effect": "allow",
                    "destination": {"type": "cidr", "value": "10.0.0.0/24"},
                    "conditions": {
                        "root": 0,
                        "nodes": [{"node": "leaf", "condition": {"type": "group", "value": "dev"}}]
                    }
                }]
            }]
        }"#;
        let seed: SeedFile = serde_json::from_str(raw).unwrap();
        assert_eq!(seed.nodes.len(), 1);
        assert_eq!(seed.nodes[0].max_bandwidth_mbps, 100);
        assert!(seed.policies[0].default_block);
    }
}
