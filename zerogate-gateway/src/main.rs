use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zerogate_gateway::control::{register_node, ControlLoop, RpcIpAssigner, GATEWAY_VERSION};
use zerogate_gateway::server::{listener_config, TunnelServer};
use zerogate_gateway::tun::TunQueues;
use zerogate_rpc::ControlClient;

/// ZeroGate data-plane gateway.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Unique node id (UUID) provisioned for this gateway
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Control plane address, host:port
    #[arg(long, env = "CONTROL_PLANE_ADDR", default_value = "localhost:5443")]
    control_plane: String,

    /// Hostname reported on registration
    #[arg(long, env = "HOSTNAME")]
    hostname: Option<String>,

    /// UDP port for the client tunnel listener
    #[arg(long, env = "VPN_PORT", default_value_t = 6500)]
    vpn_port: u16,

    /// TUN interface name
    #[arg(long, env = "TUN_NAME", default_value = "zerogate0")]
    tun_name: String,
}

fn fallback_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .compact()
        .init();

    info!(version = GATEWAY_VERSION, "starting gateway");

    let Some(node_id) = args.node_id else {
        bail!("NODE_ID is required; use --node-id or set the NODE_ID environment variable");
    };
    let hostname = args.hostname.unwrap_or_else(fallback_hostname);

    let control_addr: SocketAddr = tokio::net::lookup_host(&args.control_plane)
        .await
        .with_context(|| format!("resolving control plane {}", args.control_plane))?
        .next()
        .with_context(|| format!("control plane {} resolved to nothing", args.control_plane))?;

    // TUN first: a gateway that cannot open its device has nothing to
    // offer and should exit before touching the control plane.
    let queues = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let tun = TunQueues::open(&args.tun_name, queues)
        .with_context(|| format!("opening TUN device {}", args.tun_name))?;

    let client = Arc::new(
        ControlClient::connect(control_addr, GATEWAY_VERSION)
            .await
            .context("connecting to the control plane")?,
    );

    // Register before serving; a gateway the control plane refuses must
    // not accept clients.
    let auth_token = register_node(&client, &node_id, &hostname)
        .await
        .context("registration failed")?;

    let assigner = Arc::new(RpcIpAssigner::new(client.clone(), auth_token.clone()));
    let server = TunnelServer::new(assigner, tun);
    let control = Arc::new(ControlLoop::new(client.clone(), auth_token, server.clone()));

    if let Err(err) = control.fetch_and_apply().await {
        warn!(%err, "initial config fetch failed; serving once the heartbeat recovers");
    }

    let listen: SocketAddr = format!("0.0.0.0:{}", args.vpn_port)
        .parse()
        .expect("literal socket address");
    let endpoint = quinn::Endpoint::server(listener_config()?, listen)
        .with_context(|| format!("binding tunnel listener on {listen}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let server_task = tokio::spawn(server.run(endpoint, shutdown_rx.clone()));
    let control_task = tokio::spawn(control.run(shutdown_rx));

    let _ = server_task.await;
    let _ = control_task.await;
    Ok(())
}
