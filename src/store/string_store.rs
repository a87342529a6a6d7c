//! The string family: `key: bytes -> value: bytes`, with an independent
//! expiration table keyed by monotonic milliseconds. See spec §3, §4.2.

use std::collections::HashMap;

use crate::error::CommandError;

#[derive(Default)]
pub struct StringStore {
    values: HashMap<Vec<u8>, Vec<u8>>,
    expirations: HashMap<Vec<u8>, u64>,
}

impl StringStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_expired(&self, key: &[u8], now_ms: u64) -> bool {
        matches!(self.expirations.get(key), Some(&deadline) if deadline <= now_ms)
    }

    /// Drops `key` if its deadline has passed. Returns whether the key is
    /// (now) absent.
    fn purge_if_expired(&mut self, key: &[u8], now_ms: u64) -> bool {
        if self.is_expired(key, now_ms) {
            self.values.remove(key);
            self.expirations.remove(key);
            true
        } else {
            false
        }
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>, ttl_ms: Option<u64>, now_ms: u64) {
        self.expirations.remove(&key);
        if let Some(ttl) = ttl_ms {
            self.expirations.insert(key.clone(), now_ms + ttl);
        }
        self.values.insert(key, value);
    }

    pub fn get(&mut self, key: &[u8], now_ms: u64) -> Option<&[u8]> {
        self.purge_if_expired(key, now_ms);
        self.values.get(key).map(|v| v.as_slice())
    }

    pub fn incr(&mut self, key: &[u8], now_ms: u64) -> Result<i64, CommandError> {
        self.purge_if_expired(key, now_ms);
        let current: i64 = match self.values.get(key) {
            None => 0,
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(CommandError::NotAnInteger)?,
        };
        let next = current.checked_add(1).ok_or(CommandError::NotAnInteger)?;
        self.values.insert(key.to_vec(), next.to_string().into_bytes());
        Ok(next)
    }

    pub fn contains(&mut self, key: &[u8], now_ms: u64) -> bool {
        self.purge_if_expired(key, now_ms);
        self.values.contains_key(key)
    }

    /// `KEYS pattern` — pattern matching itself is out of scope (§4.2); `*`
    /// and any unrecognized pattern both match every key.
    pub fn keys(&mut self, now_ms: u64) -> Vec<Vec<u8>> {
        let expired: Vec<Vec<u8>> = self
            .expirations
            .iter()
            .filter(|&(_, &deadline)| deadline <= now_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.values.remove(key);
            self.expirations.remove(key);
        }
        self.values.keys().cloned().collect()
    }

    /// Loads a key/value pair coming from the snapshot loader. Does not
    /// clear an existing deadline the way `set` does — the snapshot is
    /// only ever read into an empty store at startup.
    pub fn load(&mut self, key: Vec<u8>, value: Vec<u8>, deadline_ms: Option<u64>) {
        if let Some(deadline) = deadline_ms {
            self.expirations.insert(key.clone(), deadline);
        }
        self.values.insert(key, value);
    }

    /// Scans up to `budget` tracked expirations and purges the ones already
    /// past their deadline (§4.8 step 4's opportunistic proactive sweep).
    /// Lazy purge at access time remains authoritative; this only bounds
    /// how long an unread expired key lingers in memory.
    pub fn sweep_expired(&mut self, now_ms: u64, budget: usize) -> usize {
        let due: Vec<Vec<u8>> = self
            .expirations
            .iter()
            .take(budget)
            .filter(|&(_, &deadline)| deadline <= now_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &due {
            self.values.remove(key);
            self.expirations.remove(key);
        }
        due.len()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut s = StringStore::new();
        s.set(b"k".to_vec(), b"v".to_vec(), None, 0);
        assert_eq!(s.get(b"k", 0), Some(&b"v"[..]));
    }

    #[test]
    fn ttl_expires_lazily() {
        let mut s = StringStore::new();
        s.set(b"k".to_vec(), b"v".to_vec(), Some(50), 1_000);
        assert_eq!(s.get(b"k", 1_040), Some(&b"v"[..]));
        assert_eq!(s.get(b"k", 1_051), None);
    }

    #[test]
    fn set_without_ttl_clears_prior_deadline() {
        let mut s = StringStore::new();
        s.set(b"k".to_vec(), b"v".to_vec(), Some(10), 0);
        s.set(b"k".to_vec(), b"v2".to_vec(), None, 0);
        assert_eq!(s.get(b"k", 1_000_000), Some(&b"v2"[..]));
    }

    #[test]
    fn incr_new_then_existing_then_non_integer() {
        let mut s = StringStore::new();
        assert_eq!(s.incr(b"c", 0).unwrap(), 1);
        assert_eq!(s.incr(b"c", 0).unwrap(), 2);
        s.set(b"c".to_vec(), b"abc".to_vec(), None, 0);
        assert_eq!(s.incr(b"c", 0).unwrap_err(), CommandError::NotAnInteger);
    }

    #[test]
    fn sweep_expired_removes_due_keys_only() {
        let mut s = StringStore::new();
        s.set(b"a".to_vec(), b"1".to_vec(), Some(10), 0);
        s.set(b"b".to_vec(), b"2".to_vec(), Some(1_000), 0);
        let removed = s.sweep_expired(20, 10);
        assert_eq!(removed, 1);
        assert_eq!(s.len(), 1);
    }
}
