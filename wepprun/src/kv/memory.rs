//! In-process key/value backend with TTL expiry and pub/sub fan-out.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{KvStore, CHANNEL_CAPACITY};

/// A string entry with optional absolute expiry.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory [`KvStore`] backend.
///
/// TTL enforcement is lazy: expired entries are dropped when read or when
/// a conditional insert lands on them. Pub/sub channels are created on
/// first use and retained for the lifetime of the store.
#[derive(Default)]
pub struct MemoryKv {
    strings: DashMap<String, Entry>,
    hashes: DashMap<String, BTreeMap<String, String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl KvStore for MemoryKv {
    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        match self.strings.entry(key.to_string()) {
            MapEntry::Occupied(mut slot) => {
                if slot.get().is_expired() {
                    slot.insert(entry);
                    true
                } else {
                    false
                }
            }
            MapEntry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        if let Some(slot) = self.strings.get(key) {
            if !slot.is_expired() {
                return Some(slot.value.clone());
            }
        }
        // Drop the read guard before removing an expired entry.
        self.strings.remove_if(key, |_, e| e.is_expired());
        None
    }

    fn delete(&self, key: &str) -> bool {
        self.strings
            .remove(key)
            .map(|(_, e)| !e.is_expired())
            .unwrap_or(false)
    }

    fn scan(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .strings
            .iter()
            .filter(|slot| slot.key().starts_with(prefix) && !slot.is_expired())
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn hset(&self, key: &str, field: &str, value: &str) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    fn hget(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.get(key).and_then(|h| h.get(field).cloned())
    }

    fn hgetall(&self, key: &str) -> BTreeMap<String, String> {
        self.hashes.get(key).map(|h| h.clone()).unwrap_or_default()
    }

    fn hdel(&self, key: &str, field: &str) -> bool {
        self.hashes
            .get_mut(key)
            .map(|mut h| h.remove(field).is_some())
            .unwrap_or(false)
    }

    fn publish(&self, channel: &str, payload: &str) {
        // Send fails only when there are no subscribers, which is fine.
        let _ = self.sender(channel).send(payload.to_string());
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_set_nx_inserts_once() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("a", "1", None));
        assert!(!kv.set_nx("a", "2", None));
        assert_eq!(kv.get("a"), Some("1".to_string()));
    }

    #[test]
    fn test_set_nx_reclaims_expired_entry() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("a", "1", Some(Duration::from_millis(20))));
        assert!(!kv.set_nx("a", "2", None));
        sleep(Duration::from_millis(40));
        assert!(kv.set_nx("a", "2", None));
        assert_eq!(kv.get("a"), Some("2".to_string()));
    }

    #[test]
    fn test_get_drops_expired_entry() {
        let kv = MemoryKv::new();
        kv.set_nx("a", "1", Some(Duration::from_millis(20)));
        sleep(Duration::from_millis(40));
        assert_eq!(kv.get("a"), None);
        assert!(kv.scan("a").is_empty());
    }

    #[test]
    fn test_delete_reports_live_entries_only() {
        let kv = MemoryKv::new();
        kv.set_nx("a", "1", None);
        assert!(kv.delete("a"));
        assert!(!kv.delete("a"));
    }

    #[test]
    fn test_scan_filters_by_prefix() {
        let kv = MemoryKv::new();
        kv.set_nx("lock:r1:climate.nodb", "x", None);
        kv.set_nx("lock:r1:soils.nodb", "x", None);
        kv.set_nx("lock:r2:climate.nodb", "x", None);
        assert_eq!(
            kv.scan("lock:r1:"),
            vec![
                "lock:r1:climate.nodb".to_string(),
                "lock:r1:soils.nodb".to_string()
            ]
        );
    }

    #[test]
    fn test_hash_round_trip() {
        let kv = MemoryKv::new();
        kv.hset("r1", "locked:climate.nodb", "true");
        kv.hset("r1", "locked:soils.nodb", "false");
        assert_eq!(
            kv.hget("r1", "locked:climate.nodb"),
            Some("true".to_string())
        );
        let all = kv.hgetall("r1");
        assert_eq!(all.len(), 2);
        assert!(kv.hdel("r1", "locked:soils.nodb"));
        assert!(!kv.hdel("r1", "locked:soils.nodb"));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let kv = MemoryKv::new();
        let mut rx = kv.subscribe("r1:climate");
        kv.publish("r1:climate", "hello");
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let kv = MemoryKv::new();
        kv.publish("nobody", "listening");
    }
}
