//! End-to-end exercise of the gateway ↔ control-plane link over real
//! QUIC on loopback: register, heartbeat, config pull, sticky session
//! addresses across reconnects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;
use zerogate_control::flatten::{
    Condition, ConditionKind, ConditionTree, Destination, Effect, PolicyDoc, TreeNode,
};
use zerogate_control::registry::{Node, NodeRegistry};
use zerogate_control::server::serve;
use zerogate_control::service::{ControlPlane, TenantBundle};
use zerogate_kv::MemoryKv;
use zerogate_rpc::{dev_server_config, ControlClient, RpcCode, RpcError, CONTROL_ALPN};

struct Harness {
    addr: SocketAddr,
    node_id: Uuid,
    _shutdown: watch::Sender<bool>,
}

async fn spawn_control_plane() -> Harness {
    let registry = NodeRegistry::new();
    let node_id = Uuid::new_v4();
    registry.insert(Node {
        id: node_id,
        tenant_id: "T1".into(),
        name: "edge-1".into(),
        hostname: String::new(),
        auth_token: None,
        device_hash: None,
        client_version: String::new(),
        client_cidr: "10.8.0.0/24".parse().unwrap(),
        max_bandwidth_mbps: 250,
        last_seen_at: None,
    });

    let mut policies = HashMap::new();
    policies.insert(
        "T1".to_string(),
        TenantBundle {
            default_block: true,
            docs: vec![PolicyDoc {
                name: "devs-to-erp".into(),
                priority: 100,
                effect: Effect::Allow,
                destination: Destination::Cidr {
                    value: "10.0.0.0/24".into(),
                },
                conditions: ConditionTree {
                    root: 0,
                    nodes: vec![TreeNode::Leaf {
                        condition: Condition {
                            kind: ConditionKind::User,
                            field: "email".into(),
                            value: "a@x".into(),
                        },
                    }],
                },
            }],
        },
    );

    let service = Arc::new(ControlPlane::new(
        registry,
        Arc::new(MemoryKv::new()),
        policies,
        "test-public-key-pem".into(),
    ));

    let endpoint = quinn::Endpoint::server(
        dev_server_config(CONTROL_ALPN).unwrap(),
        "127.0.0.1:0".parse().unwrap(),
    )
    .unwrap();
    let addr = endpoint.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(serve(endpoint, service, shutdown_rx));

    Harness {
        addr,
        node_id,
        _shutdown: shutdown_tx,
    }
}

#[tokio::test]
async fn register_heartbeat_and_config_pull() {
    let harness = spawn_control_plane().await;
    let client = ControlClient::connect(harness.addr, "0.4.0").await.unwrap();

    let reg = client
        .register(&harness.node_id.to_string(), "gw1", "hash-a")
        .await
        .unwrap();
    assert_eq!(reg.auth_token.len(), 64);

    // Fresh gateway advertises "none": drift expected.
    let hb = client
        .heartbeat(&reg.auth_token, "ONLINE", "none")
        .await
        .unwrap();
    assert!(hb.config_update_available);

    let config = client.get_config(&reg.auth_token).await.unwrap();
    assert_eq!(config.tenant_id, "T1");
    assert_eq!(config.vpn_cidr, "10.8.0.0/24");
    assert_eq!(config.max_bandwidth_mbps, 250);
    assert!(config.default_block);
    assert_eq!(config.rules.len(), 1);
    assert_eq!(config.rules[0].source_value, "a@x");

    // With the served hash, the next heartbeat reports no drift.
    let hb = client
        .heartbeat(&reg.auth_token, "ONLINE", &config.config_hash)
        .await
        .unwrap();
    assert!(!hb.config_update_available);
}

#[tokio::test]
async fn session_ip_is_sticky_across_reconnects() {
    let harness = spawn_control_plane().await;

    let first_ip = {
        let client = ControlClient::connect(harness.addr, "0.4.0").await.unwrap();
        let reg = client
            .register(&harness.node_id.to_string(), "gw1", "hash-a")
            .await
            .unwrap();
        client
            .get_session_ip(&reg.auth_token, "u1", "a@x")
            .await
            .unwrap()
    };

    // New connection, same node and user: same lease inside the hour.
    let client = ControlClient::connect(harness.addr, "0.4.0").await.unwrap();
    let reg = client
        .register(&harness.node_id.to_string(), "gw1", "hash-a")
        .await
        .unwrap();
    let second_ip = client
        .get_session_ip(&reg.auth_token, "u1", "a@x")
        .await
        .unwrap();
    assert_eq!(first_ip, second_ip);

    // A different user gets a different address.
    let other = client
        .get_session_ip(&reg.auth_token, "u2", "b@x")
        .await
        .unwrap();
    assert_ne!(other, first_ip);
}

#[tokio::test]
async fn wrong_device_hash_is_denied() {
    let harness = spawn_control_plane().await;
    let client = ControlClient::connect(harness.addr, "0.4.0").await.unwrap();
    client
        .register(&harness.node_id.to_string(), "gw1", "hash-a")
        .await
        .unwrap();

    let err = client
        .register(&harness.node_id.to_string(), "gw1", "hash-b")
        .await
        .unwrap_err();
    match err {
        RpcError::Status(status) => assert_eq!(status.code, RpcCode::PermissionDenied),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_token_is_unauthenticated() {
    let harness = spawn_control_plane().await;
    let client = ControlClient::connect(harness.addr, "0.4.0").await.unwrap();
    let err = client.get_config("feedbeef").await.unwrap_err();
    match err {
        RpcError::Status(status) => assert_eq!(status.code, RpcCode::Unauthenticated),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn sync_sessions_round_trips() {
    let harness = spawn_control_plane().await;
    let client = ControlClient::connect(harness.addr, "0.4.0").await.unwrap();
    let reg = client
        .register(&harness.node_id.to_string(), "gw1", "hash-a")
        .await
        .unwrap();
    let ip = client
        .get_session_ip(&reg.auth_token, "u1", "a@x")
        .await
        .unwrap();

    client
        .sync_sessions(
            &reg.auth_token,
            vec![zerogate_rpc::SessionRecord {
                user_id: "u1".into(),
                email: "a@x".into(),
                ip,
                connected_at: 1_700_000_000,
            }],
        )
        .await
        .unwrap();
}
