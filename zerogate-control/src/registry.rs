use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use rand::RngCore;
use tracing::info;
use uuid::Uuid;
use zerogate_rpc::RpcStatus;

/// A provisioned gateway node. Created by the tenant administration
/// surface; the registry only mutates its runtime half (token, device
/// hash, version, last-seen).
#[derive(Debug, Clone)]
pub struct Node {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub hostname: String,
    pub auth_token: Option<String>,
    pub device_hash: Option<String>,
    pub client_version: String,
    pub client_cidr: Ipv4Net,
    pub max_bandwidth_mbps: u64,
    pub last_seen_at: Option<i64>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn new_auth_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// In-memory node store with a token index for the authenticated calls.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<Uuid, Arc<RwLock<Node>>>,
    by_token: DashMap<String, Uuid>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: Node) {
        if let Some(token) = &node.auth_token {
            self.by_token.insert(token.clone(), node.id);
        }
        self.nodes.insert(node.id, Arc::new(RwLock::new(node)));
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<RwLock<Node>>> {
        self.nodes.get(id).map(|n| n.clone())
    }

    /// Resolves the node behind an auth token. A snapshot is returned;
    /// callers that mutate go back through the registry.
    pub fn get_by_token(&self, token: &str) -> Option<Node> {
        let id = *self.by_token.get(token)?;
        let node = self.nodes.get(&id)?;
        let node = node.read().clone();
        // A rotated token may leave a stale index entry behind.
        if node.auth_token.as_deref() == Some(token) {
            Some(node)
        } else {
            None
        }
    }

    /// The `Register` semantics: first contact mints a token; later
    /// contacts re-issue it only to the same hardware.
    pub fn register(
        &self,
        node_id: &str,
        hostname: &str,
        device_hash: &str,
        client_version: &str,
    ) -> Result<String, RpcStatus> {
        let id = Uuid::parse_str(node_id)
            .map_err(|_| RpcStatus::invalid_argument("invalid node_id format"))?;
        let entry = self
            .nodes
            .get(&id)
            .ok_or_else(|| RpcStatus::not_found("gateway not found"))?;

        let mut node = entry.write();
        match (&node.auth_token, &node.device_hash) {
            (Some(token), Some(known_hash)) => {
                if known_hash == device_hash {
                    let token = token.clone();
                    node.hostname = hostname.to_string();
                    node.client_version = client_version.to_string();
                    node.last_seen_at = Some(unix_now());
                    Ok(token)
                } else {
                    Err(RpcStatus::permission_denied(
                        "device hash does not match the registered gateway",
                    ))
                }
            }
            _ => {
                let token = new_auth_token();
                node.auth_token = Some(token.clone());
                node.device_hash = Some(device_hash.to_string());
                node.hostname = hostname.to_string();
                node.client_version = client_version.to_string();
                node.last_seen_at = Some(unix_now());
                self.by_token.insert(token.clone(), id);
                info!(node = %id, hostname, "gateway registered");
                Ok(token)
            }
        }
    }

    pub fn touch(&self, id: &Uuid) {
        if let Some(entry) = self.nodes.get(id) {
            entry.write().last_seen_at = Some(unix_now());
        }
    }
}
