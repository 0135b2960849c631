use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use zerogate_policy::RuleSpec;

/// Standard-ish RPC status codes; the subset this surface uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcCode {
    Unauthenticated,
    PermissionDenied,
    NotFound,
    InvalidArgument,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: RpcCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(RpcCode::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RpcCode::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Internal, message)
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcStatus {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub hostname: String,
    pub device_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub auth_token: String,
    pub status: String,
    pub config_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub config_update_available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConfigRequest {
    pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConfigResponse {
    pub tenant_id: String,
    pub vpn_cidr: String,
    pub public_key_pem: String,
    pub config_hash: String,
    pub rules: Vec<RuleSpec>,
    pub default_block: bool,
    pub max_bandwidth_mbps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSessionIpRequest {
    pub auth_token: String,
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSessionIpResponse {
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    pub email: String,
    pub ip: Ipv4Addr,
    pub connected_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSessionsRequest {
    pub auth_token: String,
    pub sessions: Vec<SessionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSessionsResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "body", rename_all = "snake_case")]
pub enum RpcRequest {
    Register(RegisterRequest),
    Heartbeat(HeartbeatRequest),
    GetConfig(GetConfigRequest),
    GetSessionIp(GetSessionIpRequest),
    SyncSessions(SyncSessionsRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "body", rename_all = "snake_case")]
pub enum RpcResponse {
    Register(RegisterResponse),
    Heartbeat(HeartbeatResponse),
    GetConfig(GetConfigResponse),
    GetSessionIp(GetSessionIpResponse),
    SyncSessions(SyncSessionsResponse),
}

/// One request frame: call metadata plus the call itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    pub request: RpcRequest,
}

/// One response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub result: Result<RpcResponse, RpcStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_round_trips() {
        let mut meta = BTreeMap::new();
        meta.insert(crate::GATEWAY_VERSION_HEADER.to_string(), "0.4.0".to_string());
        let env = RequestEnvelope {
            meta,
            request: RpcRequest::Heartbeat(HeartbeatRequest {
                auth_token: "t".into(),
                status: "ONLINE".into(),
                config_hash: "none".into(),
            }),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"method\":\"heartbeat\""));
        let back: RequestEnvelope = serde_json::from_str(&json).unwrap();
        match back.request {
            RpcRequest::Heartbeat(hb) => assert_eq!(hb.status, "ONLINE"),
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn error_response_round_trips() {
        let env = ResponseEnvelope {
            result: Err(RpcStatus::not_found("gateway not found")),
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: ResponseEnvelope = serde_json::from_str(&json).unwrap();
        match back.result {
            Err(status) => assert_eq!(status.code, RpcCode::NotFound),
            Ok(_) => panic!("expected error"),
        }
    }
}
