use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zerogate_auth::Keypair;
use zerogate_control::registry::NodeRegistry;
use zerogate_control::seed;
use zerogate_control::server;
use zerogate_control::service::{ControlPlane, TenantBundle};
use zerogate_kv::MemoryKv;
use zerogate_rpc::{dev_server_config, CONTROL_ALPN};

/// ZeroGate control plane: policy distribution and gateway coordination.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP address for the gateway RPC listener
    #[arg(long, env = "CONTROL_LISTEN_ADDR", default_value = "0.0.0.0:5443")]
    listen: SocketAddr,

    /// JSON seed document with provisioned nodes and tenant policies
    #[arg(long, env = "CONTROL_SEED", default_value = "seed.json")]
    seed: PathBuf,

    /// Validate the seed document and exit
    #[arg(long)]
    check_seed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .compact()
        .init();

    let seed = seed::load(&args.seed)
        .with_context(|| format!("loading seed document {}", args.seed.display()))?;
    if args.check_seed {
        println!("seed document ok: {} nodes", seed.nodes.len());
        return Ok(());
    }

    let public_key_pem = match seed.public_key_pem.clone() {
        Some(pem) => pem,
        None => {
            let keypair = Keypair::generate();
            let key_path = args.seed.with_file_name("dev-identity.pem");
            std::fs::write(&key_path, keypair.private_key_pem())
                .with_context(|| format!("writing {}", key_path.display()))?;
            warn!(
                path = %key_path.display(),
                "no identity public key in seed; generated a dev keypair"
            );
            keypair.public_key_pem()
        }
    };

    let registry = NodeRegistry::new();
    for node in seed.nodes {
        registry.insert(node.into_node());
    }
    let mut policies = HashMap::new();
    for tenant in seed.policies {
        policies.insert(
            tenant.tenant_id.clone(),
            TenantBundle {
                default_block: tenant.default_block,
                docs: tenant.policies,
            },
        );
    }

    let service = Arc::new(ControlPlane::new(
        registry,
        Arc::new(MemoryKv::new()),
        policies,
        public_key_pem,
    ));

    let server_config = dev_server_config(CONTROL_ALPN).context("building listener TLS")?;
    let endpoint = quinn::Endpoint::server(server_config, args.listen)
        .with_context(|| format!("binding control listener on {}", args.listen))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    server::serve(endpoint, service, shutdown_rx).await;
    Ok(())
}
