use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use thiserror::Error;
use tracing::{debug, info};

use crate::{KvError, KvStore};

/// Sticky leases live for an hour; every heartbeat that names the
/// session refreshes both directions.
pub const LEASE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("address pool {cidr} exhausted")]
    PoolExhausted { cidr: Ipv4Net },

    #[error(transparent)]
    Kv(#[from] KvError),
}

fn user_key(tenant: &str, user: &str) -> String {
    format!("ip:user:{tenant}:{user}")
}

fn ip_key(tenant: &str, ip: Ipv4Addr) -> String {
    format!("ip:allocated:{tenant}:{ip}")
}

/// Per-tenant sticky IP allocation over a [`KvStore`].
///
/// Two keys per lease: `ip:user:{tenant}:{user}` holds the address,
/// `ip:allocated:{tenant}:{ip}` holds the user. The reverse key is the
/// allocation lock; compare-and-set on it is the only primitive that
/// claims an address, so no lock spans a pool scan.
pub struct IpamAllocator {
    kv: Arc<dyn KvStore>,
}

impl IpamAllocator {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Returns the user's sticky address when the lease pair is intact,
    /// otherwise claims the first free host address. The scan starts at
    /// the lowest usable host and skips network, gateway (`.1`) and
    /// broadcast, so collisions between concurrent claimants resolve
    /// deterministically.
    pub async fn assign(
        &self,
        tenant: &str,
        user: &str,
        cidr: Ipv4Net,
    ) -> Result<Ipv4Addr, IpamError> {
        if let Some(existing) = self.kv.get(&user_key(tenant, user)).await? {
            if let Ok(ip) = existing.parse::<Ipv4Addr>() {
                if self.kv.get(&ip_key(tenant, ip)).await?.as_deref() == Some(user) {
                    self.refresh(tenant, user, ip).await?;
                    debug!(%tenant, %user, %ip, "sticky lease reused");
                    return Ok(ip);
                }
            }
        }

        // hosts() excludes network and broadcast; the first host is the
        // gateway's own address.
        for ip in cidr.hosts().skip(1) {
            let reverse = ip_key(tenant, ip);
            if self.kv.set_nx_ex(&reverse, user, LEASE_TTL).await? {
                self.kv
                    .set_ex(&user_key(tenant, user), &ip.to_string(), LEASE_TTL)
                    .await?;
                info!(%tenant, %user, %ip, "lease allocated");
                return Ok(ip);
            }
            // A dangling reverse key from a half-expired pair still
            // belongs to this user; repair the forward key and reuse.
            if self.kv.get(&reverse).await?.as_deref() == Some(user) {
                self.refresh(tenant, user, ip).await?;
                self.kv
                    .set_ex(&user_key(tenant, user), &ip.to_string(), LEASE_TTL)
                    .await?;
                return Ok(ip);
            }
        }

        Err(IpamError::PoolExhausted { cidr })
    }

    /// Touches both lease keys. Called once per session per heartbeat.
    pub async fn refresh(&self, tenant: &str, user: &str, ip: Ipv4Addr) -> Result<(), IpamError> {
        self.kv.expire(&user_key(tenant, user), LEASE_TTL).await?;
        self.kv.expire(&ip_key(tenant, ip), LEASE_TTL).await?;
        Ok(())
    }

    /// Best-effort release; TTL expiry reclaims the lease anyway. Only
    /// deletes when the reverse key still names the releasing user.
    pub async fn release(&self, tenant: &str, user: &str, ip: Ipv4Addr) -> Result<(), IpamError> {
        let reverse = ip_key(tenant, ip);
        if self.kv.get(&reverse).await?.as_deref() == Some(user) {
            self.kv.del(&reverse).await?;
            self.kv.del(&user_key(tenant, user)).await?;
            debug!(%tenant, %user, %ip, "lease released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;

    fn allocator() -> IpamAllocator {
        IpamAllocator::new(Arc::new(MemoryKv::new()))
    }

    fn pool() -> Ipv4Net {
        "10.8.0.0/24".parse().unwrap()
    }

    #[tokio::test]
    async fn first_assignment_starts_at_dot_two() {
        let ipam = allocator();
        let ip = ipam.assign("T1", "u1", pool()).await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 8, 0, 2));
    }

    #[tokio::test]
    async fn repeated_assign_is_sticky() {
        let ipam = allocator();
        let first = ipam.assign("T1", "u1", pool()).await.unwrap();
        let second = ipam.assign("T1", "u1", pool()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn distinct_users_get_distinct_addresses() {
        let ipam = allocator();
        let a = ipam.assign("T1", "u1", pool()).await.unwrap();
        let b = ipam.assign("T1", "u2", pool()).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn tenants_do_not_share_lease_space() {
        let ipam = allocator();
        let a = ipam.assign("T1", "u1", pool()).await.unwrap();
        let b = ipam.assign("T2", "u1", pool()).await.unwrap();
        // Same scan order, different key namespace: both may claim .2.
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn both_lease_keys_exist_after_assign() {
        let kv = Arc::new(MemoryKv::new());
        let ipam = IpamAllocator::new(kv.clone() as Arc<dyn KvStore>);
        let ip = ipam.assign("T1", "u1", pool()).await.unwrap();
        assert_eq!(
            kv.get("ip:user:T1:u1").await.unwrap(),
            Some(ip.to_string())
        );
        assert_eq!(
            kv.get(&format!("ip:allocated:T1:{ip}")).await.unwrap(),
            Some("u1".to_string())
        );
    }

    #[tokio::test]
    async fn exhausted_pool_is_reported() {
        let ipam = allocator();
        let tiny: Ipv4Net = "10.8.0.0/29".parse().unwrap();
        // Hosts .1..=.6; .1 is the gateway, leaving five leases.
        for i in 0..5 {
            ipam.assign("T1", &format!("u{i}"), tiny).await.unwrap();
        }
        match ipam.assign("T1", "one-too-many", tiny).await {
            Err(IpamError::PoolExhausted { cidr }) => assert_eq!(cidr, tiny),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_frees_the_address() {
        let ipam = allocator();
        let ip = ipam.assign("T1", "u1", pool()).await.unwrap();
        ipam.release("T1", "u1", ip).await.unwrap();
        let next = ipam.assign("T1", "u2", pool()).await.unwrap();
        assert_eq!(next, ip);
    }

    #[tokio::test]
    async fn release_by_wrong_user_is_a_noop() {
        let ipam = allocator();
        let ip = ipam.assign("T1", "u1", pool()).await.unwrap();
        ipam.release("T1", "intruder", ip).await.unwrap();
        assert_eq!(ipam.assign("T1", "u1", pool()).await.unwrap(), ip);
    }
}
