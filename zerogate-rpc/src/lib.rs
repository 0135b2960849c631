//! The wire contract between gateways and the control plane.
//!
//! The transport is QUIC: one bidirectional stream per call, one
//! length-prefixed JSON frame in each direction. Errors travel as typed
//! status codes, never as raw backend errors.

mod client;
mod codec;
mod tls;
mod types;

pub use client::{ControlClient, RpcError};
pub use codec::{read_frame, write_frame, CodecError, MAX_FRAME};
pub use tls::{dev_server_config, insecure_client_config};
pub use types::*;

/// ALPN for the gateway ↔ control-plane link.
pub const CONTROL_ALPN: &[u8] = b"zerogate-ctrl";

/// Metadata key carrying the gateway semver on `Register`.
pub const GATEWAY_VERSION_HEADER: &str = "x-gateway-version";
