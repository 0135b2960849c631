//! The data-plane gateway.
//!
//! Terminates client QUIC tunnels, authenticates `target` tokens,
//! provisions sessions with sticky addresses from the control plane,
//! applies per-packet conditional access, and shuttles IPv4 packets
//! between encrypted datagrams and a multiqueue TUN device.

pub mod control;
pub mod crypto;
pub mod limiter;
pub mod netsetup;
pub mod server;
pub mod session;
pub mod tun;

use thiserror::Error;
use zerogate_auth::AuthError;
use zerogate_rpc::RpcError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("tun device error: {0}")]
    Tun(String),

    #[error("control plane error: {0}")]
    Rpc(#[from] RpcError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
