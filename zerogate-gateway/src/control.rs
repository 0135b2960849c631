//! The gateway's half of the control-plane contract: registration,
//! the 30-second heartbeat loop, config installs and session sync.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zerogate_rpc::ControlClient;

use crate::server::{IpAssigner, TunnelServer};
use crate::{GatewayError, Result};

pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Hardware fingerprint pinning a node id to one machine. DMI serials
/// when readable, machine-id next, hostname as the container fallback.
pub fn device_hash() -> String {
    let mut signatures: Vec<String> = Vec::new();
    for path in [
        "/sys/class/dmi/id/board_serial",
        "/sys/class/dmi/id/product_uuid",
        "/etc/machine-id",
    ] {
        if let Ok(content) = std::fs::read_to_string(path) {
            let content = content.trim();
            if !content.is_empty() {
                signatures.push(content.to_string());
            }
        }
    }
    if signatures.is_empty() {
        warn!("no DMI/hardware identity readable; falling back to hostname");
        signatures.push(std::env::var("HOSTNAME").unwrap_or_default());
    }
    let mut hasher = Sha256::new();
    hasher.update(signatures.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

/// Sticky addresses come from the control plane, which owns the lease
/// store; the gateway never allocates locally.
pub struct RpcIpAssigner {
    client: Arc<ControlClient>,
    auth_token: String,
}

impl RpcIpAssigner {
    pub fn new(client: Arc<ControlClient>, auth_token: String) -> Self {
        Self { client, auth_token }
    }
}

#[async_trait]
impl IpAssigner for RpcIpAssigner {
    async fn assign(&self, user_id: &str, email: &str) -> Result<Ipv4Addr> {
        self.client
            .get_session_ip(&self.auth_token, user_id, email)
            .await
            .map_err(GatewayError::Rpc)
    }

    async fn release(&self, _ip: Ipv4Addr, _user_id: &str) {
        // The lease TTL reclaims after an hour; that hour of stickiness
        // is what lets a reconnect get the same address back.
    }
}

/// Registered connection to the control plane driving the config and
/// telemetry cycle.
pub struct ControlLoop {
    client: Arc<ControlClient>,
    auth_token: String,
    server: Arc<TunnelServer>,
    config_hash: Mutex<String>,
}

/// Registers this node and returns its auth token. Fatal on failure: a
/// gateway with no control plane has no policies and no address pool.
pub async fn register_node(
    client: &ControlClient,
    node_id: &str,
    hostname: &str,
) -> Result<String> {
    let hash = device_hash();
    debug!(device_hash = %hash, "registering gateway");
    let response = client.register(node_id, hostname, &hash).await?;
    info!(node_id, "gateway registered");
    Ok(response.auth_token)
}

impl ControlLoop {
    pub fn new(client: Arc<ControlClient>, auth_token: String, server: Arc<TunnelServer>) -> Self {
        Self {
            client,
            auth_token,
            server,
            config_hash: Mutex::new("none".to_string()),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub fn server(&self) -> &Arc<TunnelServer> {
        &self.server
    }

    /// Pulls the current config and installs it.
    pub async fn fetch_and_apply(&self) -> Result<()> {
        let config = self.client.get_config(&self.auth_token).await?;
        info!(
            cidr = %config.vpn_cidr,
            rules = config.rules.len(),
            hash = %config.config_hash,
            "config received"
        );
        *self.config_hash.lock() = config.config_hash.clone();
        self.server.install_config(config)
    }

    /// Heartbeat every 30 s; config pull on hash drift; session sync
    /// every cycle. Errors are logged and retried next tick while the
    /// last good bundle keeps serving.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("control loop stopped");
    }

    async fn tick(&self) {
        let hash = self.config_hash.lock().clone();
        let heartbeat = match self.client.heartbeat(&self.auth_token, "ONLINE", &hash).await {
            Ok(heartbeat) => heartbeat,
            Err(err) => {
                warn!(%err, "heartbeat failed; retrying next tick");
                return;
            }
        };
        debug!(hash = %hash, sessions = self.server.sessions.len(), "heartbeat sent");

        if heartbeat.config_update_available {
            if let Err(err) = self.fetch_and_apply().await {
                warn!(%err, "config update failed; keeping the last good bundle");
            }
        }

        let snapshot = self.server.session_snapshot();
        if let Err(err) = self.client.sync_sessions(&self.auth_token, snapshot).await {
            warn!(%err, "session sync failed");
        }
    }
}
