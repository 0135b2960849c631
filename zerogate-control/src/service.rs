use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;
use zerogate_kv::{IpamAllocator, IpamError, KvStore};
use zerogate_policy::BundleSpec;
use zerogate_rpc::{
    GetConfigResponse, GetSessionIpResponse, HeartbeatResponse, RegisterResponse, RequestEnvelope,
    RpcRequest, RpcResponse, RpcStatus, SyncSessionsResponse, GATEWAY_VERSION_HEADER,
};

use crate::flatten::{flatten, PolicyDoc};
use crate::registry::{Node, NodeRegistry};

/// A gateway is considered live while this key holds.
const LIVENESS_TTL: Duration = Duration::from_secs(60);

/// Session snapshots are replaced every heartbeat; the TTL only has to
/// outlive a few missed beats.
const SNAPSHOT_TTL: Duration = Duration::from_secs(300);

fn liveness_key(id: &Uuid) -> String {
    format!("node:alive:{id}")
}

fn sessions_key(id: &Uuid) -> String {
    format!("node:sessions:{id}")
}

pub struct TenantBundle {
    pub default_block: bool,
    pub docs: Vec<PolicyDoc>,
}

/// The RPC service behind the five gateway operations.
pub struct ControlPlane {
    registry: NodeRegistry,
    kv: Arc<dyn KvStore>,
    ipam: IpamAllocator,
    policies: RwLock<HashMap<String, TenantBundle>>,
    public_key_pem: String,
}

impl ControlPlane {
    pub fn new(
        registry: NodeRegistry,
        kv: Arc<dyn KvStore>,
        policies: HashMap<String, TenantBundle>,
        public_key_pem: String,
    ) -> Self {
        let ipam = IpamAllocator::new(kv.clone());
        Self {
            registry,
            kv,
            ipam,
            policies: RwLock::new(policies),
            public_key_pem,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Replaces a tenant's policy set; the next heartbeat from each of
    /// its gateways will see the hash change and pull.
    pub fn install_tenant_policies(&self, tenant_id: &str, bundle: TenantBundle) {
        self.policies.write().insert(tenant_id.to_string(), bundle);
    }

    /// Flattened wire bundle for the node's tenant.
    fn bundle_for(&self, node: &Node) -> BundleSpec {
        let policies = self.policies.read();
        match policies.get(&node.tenant_id) {
            Some(tenant) => BundleSpec {
                rules: flatten(&tenant.docs),
                default_block: tenant.default_block,
            },
            None => BundleSpec {
                rules: Vec::new(),
                default_block: true,
            },
        }
    }

    fn authenticate(&self, token: &str) -> Result<Node, RpcStatus> {
        if token.is_empty() {
            return Err(RpcStatus::unauthenticated("auth_token is required"));
        }
        self.registry
            .get_by_token(token)
            .ok_or_else(|| RpcStatus::unauthenticated("invalid auth_token"))
    }

    /// Derived gateway status: the liveness key is the single source.
    pub async fn node_status(&self, id: &Uuid) -> &'static str {
        match self.kv.exists(&liveness_key(id)).await {
            Ok(true) => "CONNECTED",
            _ => "OFFLINE",
        }
    }

    pub async fn handle(&self, envelope: RequestEnvelope) -> Result<RpcResponse, RpcStatus> {
        match envelope.request {
            RpcRequest::Register(req) => {
                let client_version = envelope
                    .meta
                    .get(GATEWAY_VERSION_HEADER)
                    .cloned()
                    .unwrap_or_default();
                let token = self.registry.register(
                    &req.node_id,
                    &req.hostname,
                    &req.device_hash,
                    &client_version,
                )?;
                if let Some(node) = self.registry.get_by_token(&token) {
                    self.refresh_liveness(&node.id, "CONNECTED").await;
                }
                Ok(RpcResponse::Register(RegisterResponse { auth_token: token }))
            }

            RpcRequest::Heartbeat(req) => {
                let node = self.authenticate(&req.auth_token)?;
                self.refresh_liveness(&node.id, &req.status).await;
                self.registry.touch(&node.id);
                let hash = self.bundle_for(&node).content_hash();
                Ok(RpcResponse::Heartbeat(HeartbeatResponse {
                    config_update_available: hash != req.config_hash,
                }))
            }

            RpcRequest::GetConfig(req) => {
                let node = self.authenticate(&req.auth_token)?;
                let bundle = self.bundle_for(&node);
                let config_hash = bundle.content_hash();
                Ok(RpcResponse::GetConfig(GetConfigResponse {
                    tenant_id: node.tenant_id.clone(),
                    vpn_cidr: node.client_cidr.to_string(),
                    public_key_pem: self.public_key_pem.clone(),
                    config_hash,
                    rules: bundle.rules,
                    default_block: bundle.default_block,
                    max_bandwidth_mbps: node.max_bandwidth_mbps,
                }))
            }

            RpcRequest::GetSessionIp(req) => {
                let node = self.authenticate(&req.auth_token)?;
                let ip = self
                    .ipam
                    .assign(&node.tenant_id, &req.user_id, node.client_cidr)
                    .await
                    .map_err(|err| match err {
                        IpamError::PoolExhausted { .. } => RpcStatus::internal(err.to_string()),
                        IpamError::Kv(err) => RpcStatus::internal(err.to_string()),
                    })?;
                Ok(RpcResponse::GetSessionIp(GetSessionIpResponse { ip }))
            }

            RpcRequest::SyncSessions(req) => {
                let node = self.authenticate(&req.auth_token)?;
                let fields = req
                    .sessions
                    .iter()
                    .map(|s| {
                        let record = json!({
                            "user_id": s.user_id,
                            "email": s.email,
                            "connected_at": s.connected_at,
                        });
                        (s.ip.to_string(), record.to_string())
                    })
                    .collect();
                if let Err(err) = self
                    .kv
                    .replace_hash(&sessions_key(&node.id), fields, SNAPSHOT_TTL)
                    .await
                {
                    return Err(RpcStatus::internal(err.to_string()));
                }
                for session in &req.sessions {
                    if let Err(err) = self
                        .ipam
                        .refresh(&node.tenant_id, &session.user_id, session.ip)
                        .await
                    {
                        warn!(node = %node.id, user = %session.user_id, %err, "lease refresh failed");
                    }
                }
                Ok(RpcResponse::SyncSessions(SyncSessionsResponse {}))
            }
        }
    }

    async fn refresh_liveness(&self, id: &Uuid, status: &str) {
        if let Err(err) = self
            .kv
            .set_ex(&liveness_key(id), status, LIVENESS_TTL)
            .await
        {
            warn!(node = %id, %err, "liveness refresh failed");
        }
    }
}
