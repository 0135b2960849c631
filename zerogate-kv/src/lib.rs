//! Shared state for the control plane: a TTL-aware key-value store and
//! the sticky-lease IP allocator built on top of it.
//!
//! The store is deliberately a trait. The control plane owns the one
//! live instance, so gateways never talk to it directly and their
//! restarts cannot lose leases; a networked engine (Valkey et al.) is a
//! drop-in implementation of [`KvStore`] when a fleet needs one.

mod ipam;
mod memory;

pub use ipam::{IpamAllocator, IpamError, LEASE_TTL};
pub use memory::MemoryKv;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, KvError>;

/// The slice of a key-value server's surface the platform relies on.
///
/// `set_nx_ex` is the compare-and-set primitive the IPAM leans on: it
/// must atomically write only when the key is absent (or expired).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set-if-absent with TTL. Returns `true` when this call created the
    /// key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Refreshes the TTL of a live key. Returns `false` when the key is
    /// missing or already expired.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Replaces the whole hash stored under `key`.
    async fn replace_hash(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<()>;

    async fn get_hash(&self, key: &str) -> Result<Vec<(String, String)>>;
}
