//! Raw packet inspection for the data plane.
//!
//! Everything in this crate is pure and allocation-free: the forwarding
//! path calls into it once per packet, so parsing works directly on the
//! borrowed datagram buffer and never suspends.

mod ipv4;
mod sni;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use ipv4::{ipv4_destination, parse_ipv4, IPV4_HEADER_MIN};
pub use sni::{match_sni, SniVerdict};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {len} bytes")]
    TooShort { len: usize },

    #[error("not an IPv4 packet (version {version})")]
    NotIpv4 { version: u8 },
}

pub type Result<T> = std::result::Result<T, PacketError>;
