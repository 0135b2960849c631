use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::sync::Arc;
use zerogate_rpc::SessionRecord;

use crate::crypto::{CryptoError, SessionCipher};

struct RouteState {
    generation: u64,
    routes: Vec<Ipv4Net>,
}

/// Tracks the route set last accepted for a session, tagged with the
/// bundle generation that produced it.
pub struct RouteLedger {
    state: Mutex<RouteState>,
}

impl RouteLedger {
    pub fn new(generation: u64, routes: Vec<Ipv4Net>) -> Self {
        Self {
            state: Mutex::new(RouteState { generation, routes }),
        }
    }

    pub fn current(&self) -> Vec<Ipv4Net> {
        self.state.lock().routes.clone()
    }

    /// Records `routes` under `generation` when it is strictly newer.
    /// Returns `true` when the set also changed and a push is due; an
    /// older or equal generation is never observed after a newer one.
    pub fn advance(&self, generation: u64, routes: &[Ipv4Net]) -> bool {
        let mut state = self.state.lock();
        if generation <= state.generation {
            return false;
        }
        state.generation = generation;
        if state.routes == routes {
            return false;
        }
        state.routes = routes.to_vec();
        true
    }
}

/// One authenticated tunnel. Owns its QUIC connection and AEAD; both die
/// with the session.
pub struct ClientSession {
    pub assigned_ip: Ipv4Addr,
    pub user_id: String,
    pub email: String,
    pub groups: Vec<String>,
    pub os: String,
    pub connected_at: i64,
    pub connection: quinn::Connection,
    cipher: SessionCipher,
    routes: RouteLedger,
    /// Highest route generation actually written to the client. Pushes
    /// serialise on this lock, which keeps updates ordered per session.
    pub(crate) push_guard: tokio::sync::Mutex<u64>,
}

impl ClientSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        assigned_ip: Ipv4Addr,
        user_id: String,
        email: String,
        groups: Vec<String>,
        os: String,
        connection: quinn::Connection,
        cipher: SessionCipher,
        routes: Vec<Ipv4Net>,
        route_generation: u64,
    ) -> Self {
        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            assigned_ip,
            user_id,
            email,
            groups,
            os,
            connected_at,
            connection,
            cipher,
            routes: RouteLedger::new(route_generation, routes),
            push_guard: tokio::sync::Mutex::new(route_generation),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.seal(plaintext)
    }

    pub fn open(&self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.open(datagram)
    }

    pub fn routes(&self) -> Vec<Ipv4Net> {
        self.routes.current()
    }

    /// See [`RouteLedger::advance`].
    pub fn advance_routes(&self, generation: u64, routes: &[Ipv4Net]) -> bool {
        self.routes.advance(generation, routes)
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            user_id: self.user_id.clone(),
            email: self.email.clone(),
            ip: self.assigned_ip,
            connected_at: self.connected_at,
        }
    }
}

/// `assigned_ip → session`, read once per egress packet. DashMap keeps
/// the lookup shard-local so teardown of one session never stalls the
/// hot path of another.
#[derive(Default)]
pub struct SessionTable {
    inner: DashMap<Ipv4Addr, Arc<ClientSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a session under its address. At most one session holds
    /// an address at a time; a displaced predecessor is returned so the
    /// caller can close it.
    pub fn insert(&self, session: Arc<ClientSession>) -> Option<Arc<ClientSession>> {
        self.inner.insert(session.assigned_ip, session)
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<Arc<ClientSession>> {
        self.inner.get(&ip).map(|s| s.clone())
    }

    /// Removes the entry only when it still belongs to the given
    /// connection; a reconnect that replaced the entry is left alone.
    pub fn remove_if_connection(&self, ip: Ipv4Addr, stable_id: usize) {
        self.inner
            .remove_if(&ip, |_, s| s.connection.stable_id() == stable_id);
    }

    pub fn all(&self) -> Vec<Arc<ClientSession>> {
        self.inner.iter().map(|s| s.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<SessionRecord> {
        self.inner.iter().map(|s| s.record()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(specs: &[&str]) -> Vec<Ipv4Net> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn advance_accepts_newer_generations_with_changes() {
        let ledger = RouteLedger::new(1, nets(&["10.0.0.0/24"]));
        assert!(ledger.advance(2, &nets(&["10.0.0.0/24", "10.1.0.0/16"])));
        assert_eq!(ledger.current(), nets(&["10.0.0.0/24", "10.1.0.0/16"]));
    }

    #[test]
    fn advance_rejects_stale_generations() {
        let ledger = RouteLedger::new(5, nets(&["10.0.0.0/24"]));
        // A straggler from an older bundle must never win.
        assert!(!ledger.advance(5, &nets(&["10.9.0.0/16"])));
        assert!(!ledger.advance(4, &nets(&["10.9.0.0/16"])));
        assert_eq!(ledger.current(), nets(&["10.0.0.0/24"]));
    }

    #[test]
    fn advance_skips_pushes_for_unchanged_sets() {
        let ledger = RouteLedger::new(1, nets(&["10.0.0.0/24"]));
        assert!(!ledger.advance(2, &nets(&["10.0.0.0/24"])));
        // The generation still moved forward.
        assert!(!ledger.advance(2, &nets(&["10.1.0.0/16"])));
        assert!(ledger.advance(3, &nets(&["10.1.0.0/16"])));
    }
}
