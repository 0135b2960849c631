use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use ipnet::Ipv4Net;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tun_rs::AsyncDevice;
use zerogate_auth::TokenVerifier;
use zerogate_packet::{parse_ipv4, PacketError};
use zerogate_policy::{BundleSpec, CompiledBundle, PolicyEngine, SourceCtx};
use zerogate_rpc::{GetConfigResponse, SessionRecord};

use crate::crypto::{generate_key, CryptoError, SessionCipher};
use crate::limiter::BandwidthLimiter;
use crate::netsetup;
use crate::session::{ClientSession, SessionTable};
use crate::tun::{TunQueues, TUN_MTU};
use crate::{GatewayError, Result};

/// ALPN for the client tunnel.
pub const VPN_ALPN: &[u8] = b"vpn-quic";

const HANDSHAKE_TOKEN_MAX: usize = 8 * 1024;
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(10);

const CLOSE_ERROR: u32 = 1;
const CLOSE_SHUTDOWN: u32 = 0;

/// Builds the tunnel listener config: dev TLS, datagrams, 30 s idle
/// timeout, 10 s keep-alive.
pub fn listener_config() -> Result<quinn::ServerConfig> {
    let mut config = zerogate_rpc::dev_server_config(VPN_ALPN)
        .map_err(GatewayError::Rpc)?;
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(IDLE_TIMEOUT.try_into().expect("30s is a valid timeout")));
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    transport.datagram_receive_buffer_size(Some(1024 * 1024));
    transport.datagram_send_buffer_size(1024 * 1024);
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// Where session addresses come from. The production implementation
/// calls `GetSessionIP` on the control plane; tests substitute a local
/// pool.
#[async_trait]
pub trait IpAssigner: Send + Sync {
    async fn assign(&self, user_id: &str, email: &str) -> Result<Ipv4Addr>;

    /// Best-effort; lease TTLs reclaim regardless.
    async fn release(&self, ip: Ipv4Addr, user_id: &str);
}

/// Tenant-level settings that arrive with `GetConfig`.
pub struct RuntimeConfig {
    pub tenant_id: String,
    pub client_cidr: Ipv4Net,
    pub gateway_ip: Ipv4Net,
}

/// Per-packet drop accounting; transient failures never surface to the
/// peer, so the counters are the only way to see them.
#[derive(Debug, Default)]
pub struct DropCounters {
    pub short_datagram: AtomicU64,
    pub decrypt_failed: AtomicU64,
    pub not_ipv4: AtomicU64,
    pub policy_denied: AtomicU64,
    pub unknown_destination: AtomicU64,
}

impl DropCounters {
    pub fn policy_denied_count(&self) -> u64 {
        self.policy_denied.load(Ordering::Relaxed)
    }

    pub fn short_datagram_count(&self) -> u64 {
        self.short_datagram.load(Ordering::Relaxed)
    }
}

#[derive(Serialize)]
struct HandshakeResponse {
    assigned_ip: String,
    gw_ip: String,
    routes: Vec<String>,
    session_key: String,
}

#[derive(Serialize)]
struct RouteUpdate {
    #[serde(rename = "type")]
    kind: &'static str,
    routes: Vec<String>,
}

struct HandshakeFailure {
    reason: &'static str,
    detail: String,
}

impl HandshakeFailure {
    fn new(reason: &'static str, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

fn route_strings(routes: &[Ipv4Net]) -> Vec<String> {
    routes.iter().map(|net| net.to_string()).collect()
}

/// The QUIC tunnel server and everything a packet needs on its way
/// through: session table, policy engine, limiter, TUN queues.
pub struct TunnelServer {
    pub sessions: SessionTable,
    pub engine: PolicyEngine,
    pub limiter: BandwidthLimiter,
    pub counters: DropCounters,
    verifier: ArcSwapOption<TokenVerifier>,
    runtime: ArcSwapOption<RuntimeConfig>,
    route_generation: AtomicU64,
    network_ready: AtomicBool,
    assigner: Arc<dyn IpAssigner>,
    tun: TunQueues,
}

impl TunnelServer {
    pub fn new(assigner: Arc<dyn IpAssigner>, tun: TunQueues) -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionTable::new(),
            engine: PolicyEngine::new(),
            limiter: BandwidthLimiter::unlimited(),
            counters: DropCounters::default(),
            verifier: ArcSwapOption::empty(),
            runtime: ArcSwapOption::empty(),
            route_generation: AtomicU64::new(0),
            network_ready: AtomicBool::new(false),
            assigner,
            tun,
        })
    }

    pub fn session_snapshot(&self) -> Vec<SessionRecord> {
        self.sessions.snapshot()
    }

    /// Installs a config bundle atomically: verifier, network, limiter,
    /// policy engine, then a route broadcast for affected sessions.
    pub fn install_config(&self, config: GetConfigResponse) -> Result<()> {
        let verifier = TokenVerifier::from_public_key_pem(&config.public_key_pem)?;
        self.verifier.store(Some(Arc::new(verifier)));

        let client_cidr: Ipv4Net = config
            .vpn_cidr
            .parse()
            .map_err(|e| GatewayError::Config(format!("bad vpn_cidr {}: {e}", config.vpn_cidr)))?;
        let gateway_ip = netsetup::gateway_address(client_cidr);

        if let Some(previous) = self.runtime.load_full() {
            if previous.client_cidr != client_cidr {
                warn!(
                    old = %previous.client_cidr,
                    new = %client_cidr,
                    "client CIDR changed; interface re-plumbing needs a restart"
                );
            }
        } else if !self.network_ready.swap(true, Ordering::SeqCst) {
            netsetup::setup_network(self.tun.name(), client_cidr, TUN_MTU);
        }

        self.runtime.store(Some(Arc::new(RuntimeConfig {
            tenant_id: config.tenant_id,
            client_cidr,
            gateway_ip,
        })));

        self.limiter.set_rate_mbps(config.max_bandwidth_mbps);

        let bundle = CompiledBundle::compile(&BundleSpec {
            rules: config.rules,
            default_block: config.default_block,
        });
        info!(rules = bundle.len(), hash = bundle.hash(), "policy bundle installed");
        self.engine.install(bundle);

        self.broadcast_route_updates();
        Ok(())
    }

    /// Recomputes every session's route set under a fresh generation and
    /// pushes to the sessions whose set changed.
    pub fn broadcast_route_updates(&self) {
        let generation = self.route_generation.fetch_add(1, Ordering::SeqCst) + 1;
        for session in self.sessions.all() {
            let routes = self
                .engine
                .allowed_cidrs(&session.email, &session.groups, &session.os);
            if !session.advance_routes(generation, &routes) {
                continue;
            }
            tokio::spawn(push_route_update(session, generation, routes));
        }
    }

    /// Accept loop plus the TUN reader fleet. Runs until shutdown.
    pub async fn run(
        self: Arc<Self>,
        endpoint: quinn::Endpoint,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            addr = ?endpoint.local_addr(),
            queues = self.tun.queue_count(),
            "tunnel server listening"
        );

        for (idx, device) in self.tun.queues().iter().enumerate() {
            tokio::spawn(self.clone().egress_loop(device.clone(), idx));
        }

        let mut round_robin = 0usize;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                incoming = endpoint.accept() => {
                    let Some(incoming) = incoming else { break };
                    let queue_idx = round_robin;
                    round_robin = round_robin.wrapping_add(1);
                    tokio::spawn(self.clone().handle_connection(incoming, queue_idx));
                }
            }
        }

        for session in self.sessions.all() {
            session
                .connection
                .close(CLOSE_SHUTDOWN.into(), b"Disconnecting");
        }
        endpoint.close(CLOSE_SHUTDOWN.into(), b"Disconnecting");
        info!("tunnel server stopped");
    }

    async fn handle_connection(self: Arc<Self>, incoming: quinn::Incoming, queue_idx: usize) {
        let connection = match incoming.await {
            Ok(connection) => connection,
            Err(err) => {
                debug!(%err, "tunnel handshake failed");
                return;
            }
        };
        let remote = connection.remote_address();

        let session = match self.handshake(&connection).await {
            Ok(session) => session,
            Err(failure) => {
                warn!(%remote, reason = failure.reason, detail = %failure.detail, "handshake rejected");
                connection.close(CLOSE_ERROR.into(), failure.reason.as_bytes());
                return;
            }
        };

        info!(%remote, user = %session.email, ip = %session.assigned_ip, "client connected");
        self.ingress_loop(&session, queue_idx).await;
        self.teardown(session).await;
    }

    /// AwaitToken → Authorising → Provisioning, producing a published
    /// session or a close reason.
    async fn handshake(
        &self,
        connection: &quinn::Connection,
    ) -> std::result::Result<Arc<ClientSession>, HandshakeFailure> {
        let verifier = self
            .verifier
            .load_full()
            .ok_or_else(|| HandshakeFailure::new("Server Not Ready", "no public key installed"))?;
        let runtime = self
            .runtime
            .load_full()
            .ok_or_else(|| HandshakeFailure::new("Server Not Ready", "no config installed"))?;

        // AwaitToken: first bidirectional stream carries the raw JWT.
        let handshake_io = async {
            let (send, mut recv) = connection
                .accept_bi()
                .await
                .map_err(|e| HandshakeFailure::new("Protocol Error", e.to_string()))?;
            let token = recv
                .read_to_end(HANDSHAKE_TOKEN_MAX)
                .await
                .map_err(|e| HandshakeFailure::new("Protocol Error", e.to_string()))?;
            Ok::<_, HandshakeFailure>((send, token))
        };
        let (mut send, token_bytes) = tokio::time::timeout(HANDSHAKE_DEADLINE, handshake_io)
            .await
            .map_err(|_| HandshakeFailure::new("Protocol Error", "handshake timed out"))??;

        let token = std::str::from_utf8(&token_bytes)
            .map_err(|_| HandshakeFailure::new("Auth Fail", "token is not utf-8"))?
            .trim();

        // Authorising: EdDSA signature, expiry, purpose and tenant.
        let claims = verifier
            .verify_target(token, &runtime.tenant_id)
            .map_err(|e| HandshakeFailure::new("Auth Fail", e.to_string()))?;

        let assigned_ip = self
            .assigner
            .assign(&claims.sub, &claims.email)
            .await
            .map_err(|e| HandshakeFailure::new("IP Full", e.to_string()))?;

        // Provisioning: fresh AEAD key, route set, JSON response.
        let key = generate_key();
        let cipher = SessionCipher::new(&key);
        let generation = self.route_generation.load(Ordering::SeqCst);
        let routes = self
            .engine
            .allowed_cidrs(&claims.email, &claims.groups, &claims.os);

        let response = HandshakeResponse {
            assigned_ip: format!("{assigned_ip}/{}", runtime.client_cidr.prefix_len()),
            gw_ip: runtime.gateway_ip.to_string(),
            routes: route_strings(&routes),
            session_key: hex::encode(key),
        };
        let body = serde_json::to_vec(&response)
            .map_err(|e| HandshakeFailure::new("JSON Marshal Error", e.to_string()))?;
        send.write_all(&body)
            .await
            .map_err(|e| HandshakeFailure::new("Protocol Error", e.to_string()))?;
        send.finish()
            .map_err(|e| HandshakeFailure::new("Protocol Error", e.to_string()))?;

        let session = Arc::new(ClientSession::new(
            assigned_ip,
            claims.sub,
            claims.email,
            claims.groups,
            claims.os,
            connection.clone(),
            cipher,
            routes,
            generation,
        ));

        if let Some(displaced) = self.sessions.insert(session.clone()) {
            warn!(ip = %assigned_ip, user = %displaced.email, "address reassigned; closing stale session");
            displaced
                .connection
                .close(CLOSE_ERROR.into(), b"Session Replaced");
        }

        Ok(session)
    }

    /// Client → internal: decrypt, parse, authorise, throttle, TUN.
    async fn ingress_loop(&self, session: &Arc<ClientSession>, queue_idx: usize) {
        let device = self.tun.queue(queue_idx);
        loop {
            let datagram = match session.connection.read_datagram().await {
                Ok(datagram) => datagram,
                Err(err) => {
                    debug!(user = %session.email, %err, "tunnel closed");
                    return;
                }
            };

            let Some(packet) = self.decrypt_ingress(session, &datagram) else {
                continue;
            };
            if !self.authorize_ingress(session, &packet) {
                continue;
            }

            self.limiter.wait_n(packet.len()).await;
            if let Err(err) = device.send(&packet).await {
                error!(%err, "tun write failed");
            }
        }
    }

    /// Datagram → plaintext IPv4 packet, or a counted drop.
    fn decrypt_ingress(&self, session: &ClientSession, datagram: &[u8]) -> Option<Vec<u8>> {
        let packet = match session.open(datagram) {
            Ok(packet) => packet,
            Err(CryptoError::TooShort { .. }) => {
                self.counters.short_datagram.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(_) => {
                self.counters.decrypt_failed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        Some(packet)
    }

    /// IPv4 gate plus the policy decision. IPv6 is dropped silently.
    fn authorize_ingress(&self, session: &ClientSession, packet: &[u8]) -> bool {
        let (src, dst, _protocol) = match parse_ipv4(packet) {
            Ok(parsed) => parsed,
            Err(PacketError::NotIpv4 { .. }) | Err(PacketError::TooShort { .. }) => {
                self.counters.not_ipv4.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        let source = SourceCtx {
            ip: src,
            identity: &session.email,
            groups: &session.groups,
            os: &session.os,
        };
        if !self.engine.is_allowed(packet, &source, dst) {
            self.counters.policy_denied.fetch_add(1, Ordering::Relaxed);
            debug!(user = %session.email, %dst, "packet denied");
            return false;
        }
        true
    }

    /// Internal → client: one reader per TUN queue. A persistent read
    /// error terminates this queue's reader.
    async fn egress_loop(self: Arc<Self>, device: Arc<AsyncDevice>, idx: usize) {
        let mut buf = vec![0u8; 1500];
        loop {
            let n = match device.recv(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    error!(queue = idx, %err, "tun read failed; reader exiting");
                    return;
                }
            };
            let packet = &buf[..n];

            let Some(dst) = zerogate_packet::ipv4_destination(packet) else {
                continue;
            };
            let Some(session) = self.sessions.get(dst) else {
                self.counters
                    .unknown_destination
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            };

            self.limiter.wait_n(n).await;
            let sealed = match session.seal(packet) {
                Ok(sealed) => sealed,
                Err(_) => continue,
            };
            if let Err(err) = session.connection.send_datagram(Bytes::from(sealed)) {
                debug!(ip = %dst, %err, "datagram send failed");
            }
        }
    }

    /// Closed: unpublish, release the lease, close the connection.
    async fn teardown(&self, session: Arc<ClientSession>) {
        self.sessions
            .remove_if_connection(session.assigned_ip, session.connection.stable_id());
        self.assigner
            .release(session.assigned_ip, &session.user_id)
            .await;
        session
            .connection
            .close(CLOSE_SHUTDOWN.into(), b"Disconnecting");
        info!(user = %session.email, ip = %session.assigned_ip, "client disconnected");
    }
}

/// Writes one route-update message on a fresh unidirectional stream.
/// Failures are logged and the client is left to QUIC idle timeout.
async fn push_route_update(session: Arc<ClientSession>, generation: u64, routes: Vec<Ipv4Net>) {
    let mut last_pushed = session.push_guard.lock().await;
    if generation <= *last_pushed {
        return;
    }

    let message = RouteUpdate {
        kind: "route_update",
        routes: route_strings(&routes),
    };
    let body = match serde_json::to_vec(&message) {
        Ok(body) => body,
        Err(err) => {
            error!(%err, "route update serialization failed");
            return;
        }
    };

    let mut stream = match session.connection.open_uni().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(user = %session.email, %err, "route update stream failed");
            return;
        }
    };
    if let Err(err) = stream.write_all(&body).await {
        warn!(user = %session.email, %err, "route update write failed");
        return;
    }
    let _ = stream.finish();
    *last_pushed = generation;
    info!(user = %session.email, generation, routes = message.routes.len(), "route update pushed");
}
