use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{KvStore, Result};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if at <= Instant::now())
    }
}

/// In-process TTL store. Expiry is lazy: reads treat a stale slot as
/// absent, and `purge_expired` sweeps leftovers.
///
/// Atomicity of `set_nx_ex` comes from holding the shard entry across
/// the occupied/expired check and the write.
#[derive(Default)]
pub struct MemoryKv {
    slots: DashMap<String, Slot>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn purge_expired(&self) {
        self.slots.retain(|_, slot| !slot.is_expired());
    }

    fn live(&self, key: &str) -> Option<Value> {
        let slot = self.slots.get(key)?;
        if slot.is_expired() {
            drop(slot);
            self.slots.remove_if(key, |_, s| s.is_expired());
            return None;
        }
        Some(slot.value.clone())
    }

    fn deadline(ttl: Duration) -> Option<Instant> {
        Some(Instant::now() + ttl)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(match self.live(key) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: Self::deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(Slot {
                        value: Value::Str(value.to_string()),
                        expires_at: Self::deadline(ttl),
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Str(value.to_string()),
                    expires_at: Self::deadline(ttl),
                });
                Ok(true)
            }
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.slots.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.remove();
                    Ok(false)
                } else {
                    occupied.get_mut().expires_at = Self::deadline(ttl);
                    Ok(true)
                }
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn replace_hash(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Hash(fields),
                expires_at: Self::deadline(ttl),
            },
        );
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> Result<Vec<(String, String)>> {
        Ok(match self.live(key) {
            Some(Value::Hash(fields)) => fields,
            _ => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(60);
    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn set_get_round_trip() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", LONG).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        assert!(kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", SHORT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(!kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn set_nx_only_wins_when_absent() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_ex("k", "first", LONG).await.unwrap());
        assert!(!kv.set_nx_ex("k", "second", LONG).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn set_nx_reclaims_expired_slot() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_ex("k", "first", SHORT).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv.set_nx_ex("k", "second", LONG).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("second".to_string()));
    }

    #[tokio::test]
    async fn expire_refreshes_only_live_keys() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", SHORT).await.unwrap();
        assert!(kv.expire("k", LONG).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Refreshed TTL kept it alive past the original deadline.
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        assert!(!kv.expire("missing", LONG).await.unwrap());
    }

    #[tokio::test]
    async fn hash_replace_is_wholesale() {
        let kv = MemoryKv::new();
        kv.replace_hash("h", vec![("a".into(), "1".into())], LONG)
            .await
            .unwrap();
        kv.replace_hash("h", vec![("b".into(), "2".into())], LONG)
            .await
            .unwrap();
        assert_eq!(
            kv.get_hash("h").await.unwrap(),
            vec![("b".to_string(), "2".to_string())]
        );
    }
}
