//! In-process key-value substrate with per-key TTLs.
//!
//! Backs the streaming fabric's replay lists (`run:<id>:responses`) and
//! the status registry (`run:<id>:status`). The contract is deliberately
//! small — string values, append-only lists, linearizable single-key
//! writes — so a networked store can replace this without touching
//! callers. Expiry is lazy: entries are dropped when touched after their
//! deadline, plus on explicit sweeps.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

enum KvValue {
    Str(String),
    List(Vec<String>),
}

struct Entry {
    value: KvValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Default)]
pub struct KvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a string value, replacing any prior value and TTL.
    pub fn set(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_owned(),
            Entry {
                value: KvValue::Str(value.into()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(e) if e.expired(now) => {
                entries.remove(key);
                None
            }
            Some(e) => match &e.value {
                KvValue::Str(s) => Some(s.clone()),
                KvValue::List(_) => None,
            },
            None => None,
        }
    }

    /// Reset the TTL of an existing key. Returns false if the key is gone.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(e) if e.expired(now) => {
                entries.remove(key);
                false
            }
            Some(e) => {
                e.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Append to a list, creating it with the given TTL on first push.
    /// Returns the list length after the push.
    pub fn rpush(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
            value: KvValue::List(Vec::new()),
            expires_at: ttl.map(|t| now + t),
        });
        match &mut entry.value {
            KvValue::List(items) => {
                items.push(value.into());
                items.len()
            }
            KvValue::Str(_) => {
                // Type clash: replace, matching last-writer-wins semantics.
                entry.value = KvValue::List(vec![value.into()]);
                entry.expires_at = ttl.map(|t| now + t);
                1
            }
        }
    }

    /// The full list at a key, in push order.
    pub fn lrange(&self, key: &str) -> Vec<String> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(e) if e.expired(now) => {
                entries.remove(key);
                Vec::new()
            }
            Some(e) => match &e.value {
                KvValue::List(items) => items.clone(),
                KvValue::Str(_) => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// Live keys starting with the prefix. Used by the startup sweep over
    /// `run:*:status`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, e| !e.expired(now));
        entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let kv = KvStore::new();
        kv.set("k", "v", None);
        assert_eq!(kv.get("k").as_deref(), Some("v"));
        assert!(kv.delete("k"));
        assert!(kv.get("k").is_none());
        assert!(!kv.delete("k"));
    }

    #[test]
    fn ttl_expires_lazily() {
        let kv = KvStore::new();
        kv.set("k", "v", Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(kv.get("k").is_none());
    }

    #[test]
    fn expire_refreshes_deadline() {
        let kv = KvStore::new();
        kv.set("k", "v", Some(Duration::from_secs(60)));
        assert!(kv.expire("k", Duration::from_secs(120)));
        assert!(!kv.expire("missing", Duration::from_secs(1)));
    }

    #[test]
    fn rpush_appends_in_order() {
        let kv = KvStore::new();
        assert_eq!(kv.rpush("list", "a", None), 1);
        assert_eq!(kv.rpush("list", "b", None), 2);
        assert_eq!(kv.lrange("list"), vec!["a", "b"]);
    }

    #[test]
    fn list_ttl_set_on_first_push() {
        let kv = KvStore::new();
        kv.rpush("list", "a", Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(kv.lrange("list").is_empty());
    }

    #[test]
    fn get_on_list_key_is_none() {
        let kv = KvStore::new();
        kv.rpush("list", "a", None);
        assert!(kv.get("list").is_none());
    }

    #[test]
    fn keys_with_prefix_filters() {
        let kv = KvStore::new();
        kv.set("run:1:status", "RUNNING", None);
        kv.set("run:2:status", "COMPLETED", None);
        kv.set("other", "x", None);

        let mut keys = kv.keys_with_prefix("run:");
        keys.sort();
        assert_eq!(keys, vec!["run:1:status", "run:2:status"]);
    }
}
