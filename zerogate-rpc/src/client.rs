use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::codec::{read_frame, write_frame, CodecError};
use crate::tls::insecure_client_config;
use crate::types::*;
use crate::{CONTROL_ALPN, GATEWAY_VERSION_HEADER};

const REGISTER_DEADLINE: Duration = Duration::from_secs(10);
const CALL_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("control plane returned {0}")]
    Status(RpcStatus),

    #[error("call timed out after {0:?}")]
    Deadline(Duration),

    #[error("connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection lost: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected response variant for {0}")]
    Mismatch(&'static str),
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Gateway-side handle to the control plane.
///
/// One QUIC connection, one bidirectional stream per call. Every call
/// after `Register` carries the node auth token inside its request body;
/// the connection itself holds no credentials.
pub struct ControlClient {
    // Kept so the endpoint driver outlives the connection.
    _endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    meta: BTreeMap<String, String>,
}

impl ControlClient {
    pub async fn connect(addr: SocketAddr, gateway_version: &str) -> Result<Self> {
        let bind: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let mut endpoint = quinn::Endpoint::client(bind)?;
        endpoint.set_default_client_config(insecure_client_config(CONTROL_ALPN)?);

        let connection = endpoint.connect(addr, "localhost")?.await?;
        debug!(%addr, "control plane connected");

        let mut meta = BTreeMap::new();
        meta.insert(
            GATEWAY_VERSION_HEADER.to_string(),
            gateway_version.to_string(),
        );
        Ok(Self {
            _endpoint: endpoint,
            connection,
            meta,
        })
    }

    async fn call(&self, request: RpcRequest, deadline: Duration) -> Result<RpcResponse> {
        let envelope = RequestEnvelope {
            meta: self.meta.clone(),
            request,
        };
        let exchange = async {
            let (mut send, mut recv) = self.connection.open_bi().await?;
            write_frame(&mut send, &envelope).await?;
            send.finish().map_err(CodecError::from)?;
            let response: ResponseEnvelope = read_frame(&mut recv).await?;
            Ok::<_, RpcError>(response)
        };
        let response = tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| RpcError::Deadline(deadline))??;
        response.result.map_err(RpcError::Status)
    }

    pub async fn register(
        &self,
        node_id: &str,
        hostname: &str,
        device_hash: &str,
    ) -> Result<RegisterResponse> {
        let request = RpcRequest::Register(RegisterRequest {
            node_id: node_id.to_string(),
            hostname: hostname.to_string(),
            device_hash: device_hash.to_string(),
        });
        match self.call(request, REGISTER_DEADLINE).await? {
            RpcResponse::Register(resp) => Ok(resp),
            _ => Err(RpcError::Mismatch("Register")),
        }
    }

    pub async fn heartbeat(
        &self,
        auth_token: &str,
        status: &str,
        config_hash: &str,
    ) -> Result<HeartbeatResponse> {
        let request = RpcRequest::Heartbeat(HeartbeatRequest {
            auth_token: auth_token.to_string(),
            status: status.to_string(),
            config_hash: config_hash.to_string(),
        });
        match self.call(request, CALL_DEADLINE).await? {
            RpcResponse::Heartbeat(resp) => Ok(resp),
            _ => Err(RpcError::Mismatch("Heartbeat")),
        }
    }

    pub async fn get_config(&self, auth_token: &str) -> Result<GetConfigResponse> {
        let request = RpcRequest::GetConfig(GetConfigRequest {
            auth_token: auth_token.to_string(),
        });
        match self.call(request, REGISTER_DEADLINE).await? {
            RpcResponse::GetConfig(resp) => Ok(resp),
            _ => Err(RpcError::Mismatch("GetConfig")),
        }
    }

    pub async fn get_session_ip(
        &self,
        auth_token: &str,
        user_id: &str,
        email: &str,
    ) -> Result<Ipv4Addr> {
        let request = RpcRequest::GetSessionIp(GetSessionIpRequest {
            auth_token: auth_token.to_string(),
            user_id: user_id.to_string(),
            email: email.to_string(),
        });
        match self.call(request, CALL_DEADLINE).await? {
            RpcResponse::GetSessionIp(resp) => Ok(resp.ip),
            _ => Err(RpcError::Mismatch("GetSessionIp")),
        }
    }

    pub async fn sync_sessions(
        &self,
        auth_token: &str,
        sessions: Vec<SessionRecord>,
    ) -> Result<()> {
        let request = RpcRequest::SyncSessions(SyncSessionsRequest {
            auth_token: auth_token.to_string(),
            sessions,
        });
        match self.call(request, CALL_DEADLINE).await? {
            RpcResponse::SyncSessions(_) => Ok(()),
            _ => Err(RpcError::Mismatch("SyncSessions")),
        }
    }
}
