//! Ordered in-memory store backing the cache.
//!
//! Items live in a B-tree keyed by item key, with a second ordered index
//! keyed by access sequence so the coldest item is always the first index
//! entry. Both maps, the memory accounting, and the access clock sit behind
//! one lock, so eviction decisions are exact: every mutation makes room
//! before it grows the store, and the oldest-access victim is found in
//! O(log n) instead of a full scan.
//!
//! Expiry supports relative TTLs and absolute Unix timestamps; expired items
//! are dropped on access and by a periodic sweep.

use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Expiry values above this many seconds are absolute Unix timestamps.
const RELATIVE_EXPIRY_LIMIT: u64 = 60 * 60 * 24 * 30;

/// A single stored item
#[derive(Debug, Clone)]
pub struct Item {
    /// The stored value
    pub value: Bytes,
    /// Opaque 32-bit client flags stored with the item
    pub flags: u32,
    /// Absolute expiration time (None = never expires)
    pub expires_at: Option<Instant>,
    /// CAS token for compare-and-swap operations
    pub cas: u64,
    /// Position in the access index; newer is larger
    last_access: u64,
}

impl Item {
    /// Approximate memory footprint of this item
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.value.len()
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() >= expires_at,
            None => false,
        }
    }
}

/// Result of a store mutation, rendered into a protocol response by the
/// connection's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Mutation succeeded
    Stored,
    /// Item was not stored (e.g. add on an existing key)
    NotStored,
    /// CAS token did not match the current item
    CasMismatch,
    /// Item not found
    NotFound,
    /// Successfully deleted
    Deleted,
    /// New counter value after incr/decr
    Counter(u64),
    /// incr/decr on a value that is not an unsigned number
    NonNumeric,
    /// All items were flushed
    Flushed,
}

/// Everything the lock guards: the item tree, the access index, the access
/// clock, and the byte accounting.
///
/// Invariant: `items` and `by_access` describe the same set of keys, and
/// `memory_used` is the sum of `memory_size() + key.len()` over `items`.
struct Inner {
    items: BTreeMap<String, Item>,
    /// Access sequence -> key. The first entry is always the coldest item.
    by_access: BTreeMap<u64, String>,
    access_clock: u64,
    memory_used: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            by_access: BTreeMap::new(),
            access_clock: 0,
            memory_used: 0,
        }
    }

    /// Move a key to the hot end of the access index and hand back its item.
    fn touch(&mut self, key: &str) -> Option<&mut Item> {
        let item = self.items.get_mut(key)?;
        self.by_access.remove(&item.last_access);
        self.access_clock += 1;
        self.by_access.insert(self.access_clock, key.to_string());
        item.last_access = self.access_clock;
        Some(item)
    }

    /// Insert or replace, keeping the index and accounting in step.
    fn insert(&mut self, key: &str, mut item: Item) {
        self.access_clock += 1;
        item.last_access = self.access_clock;
        let size = item.memory_size() + key.len();
        if let Some(old) = self.items.insert(key.to_string(), item) {
            self.by_access.remove(&old.last_access);
            self.memory_used = self
                .memory_used
                .saturating_sub(old.memory_size() + key.len());
        }
        self.by_access.insert(self.access_clock, key.to_string());
        self.memory_used += size;
    }

    /// Remove a key from both maps, returning the item.
    fn remove(&mut self, key: &str) -> Option<Item> {
        let item = self.items.remove(key)?;
        self.by_access.remove(&item.last_access);
        self.memory_used = self
            .memory_used
            .saturating_sub(item.memory_size() + key.len());
        Some(item)
    }

    /// Evict coldest-first until `needed` more bytes fit under `max_memory`
    /// or the store is empty.
    fn make_room(&mut self, needed: usize, max_memory: usize) {
        while self.memory_used + needed > max_memory {
            let Some((_, victim)) = self.by_access.first_key_value() else {
                break;
            };
            let victim = victim.clone();
            debug!(key = %victim, "Evicting coldest item");
            self.remove(&victim);
        }
    }
}

/// Thread-safe ordered store
pub struct Store {
    inner: RwLock<Inner>,
    /// Maximum memory allowed
    max_memory: usize,
    /// Default TTL in seconds (0 = no expiration)
    default_ttl: u64,
    /// CAS token counter
    cas_counter: AtomicU64,
}

impl Store {
    pub fn new(max_memory: usize, default_ttl: u64) -> Arc<Self> {
        info!(
            max_memory_mb = max_memory / 1024 / 1024,
            default_ttl, "Initializing store"
        );
        Arc::new(Self {
            inner: RwLock::new(Inner::new()),
            max_memory,
            default_ttl,
            cas_counter: AtomicU64::new(1),
        })
    }

    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Calculate expiration from a protocol exptime value.
    ///
    /// Values up to 30 days are relative seconds; larger values are absolute
    /// Unix timestamps.
    fn calculate_expiry(&self, exptime: u64) -> Option<Instant> {
        let effective = if exptime == 0 { self.default_ttl } else { exptime };
        if effective == 0 {
            None
        } else if effective > RELATIVE_EXPIRY_LIMIT {
            let delta = effective as i64 - Utc::now().timestamp();
            if delta <= 0 {
                // Already in the past: expire immediately.
                Some(Instant::now())
            } else {
                Some(Instant::now() + Duration::from_secs(delta as u64))
            }
        } else {
            Some(Instant::now() + Duration::from_secs(effective))
        }
    }

    /// Make room and write an item under an already-held lock.
    fn write_item(
        &self,
        inner: &mut Inner,
        key: &str,
        value: Bytes,
        flags: u32,
        exptime: u64,
    ) -> Outcome {
        let item = Item {
            value,
            flags,
            expires_at: self.calculate_expiry(exptime),
            cas: self.next_cas(),
            last_access: 0,
        };
        inner.make_room(item.memory_size() + key.len(), self.max_memory);
        inner.insert(key, item);
        trace!(key, memory_used = inner.memory_used, "Wrote item");
        Outcome::Stored
    }

    /// Get an item, refreshing its access position. Expired items are
    /// dropped in place.
    pub fn get(&self, key: &str) -> Option<Item> {
        let mut inner = self.inner.write().unwrap();
        if inner.items.get(key)?.is_expired() {
            trace!(key, "Dropping expired item on access");
            inner.remove(key);
            return None;
        }
        inner.touch(key).cloned()
    }

    /// Store an item unconditionally
    pub fn set(&self, key: &str, value: Bytes, flags: u32, exptime: u64) -> Outcome {
        let mut inner = self.inner.write().unwrap();
        self.write_item(&mut inner, key, value, flags, exptime)
    }

    /// Store an item only if the key is absent
    pub fn add(&self, key: &str, value: Bytes, flags: u32, exptime: u64) -> Outcome {
        let mut inner = self.inner.write().unwrap();
        match inner.items.get(key) {
            Some(item) if !item.is_expired() => Outcome::NotStored,
            _ => self.write_item(&mut inner, key, value, flags, exptime),
        }
    }

    /// Store an item only if the key is present
    pub fn replace(&self, key: &str, value: Bytes, flags: u32, exptime: u64) -> Outcome {
        let mut inner = self.inner.write().unwrap();
        match inner.items.get(key) {
            Some(item) if !item.is_expired() => {
                self.write_item(&mut inner, key, value, flags, exptime)
            }
            _ => Outcome::NotStored,
        }
    }

    /// Store only if the CAS token still matches
    pub fn cas(&self, key: &str, value: Bytes, flags: u32, exptime: u64, cas: u64) -> Outcome {
        let mut inner = self.inner.write().unwrap();
        match inner.items.get(key) {
            None => Outcome::NotFound,
            Some(item) if item.is_expired() => {
                inner.remove(key);
                Outcome::NotFound
            }
            Some(item) if item.cas != cas => Outcome::CasMismatch,
            Some(_) => self.write_item(&mut inner, key, value, flags, exptime),
        }
    }

    /// Delete an item
    pub fn delete(&self, key: &str) -> Outcome {
        let mut inner = self.inner.write().unwrap();
        match inner.remove(key) {
            Some(_) => {
                trace!(key, "Item deleted");
                Outcome::Deleted
            }
            None => Outcome::NotFound,
        }
    }

    /// Concatenate data onto an existing value
    pub fn append(&self, key: &str, tail: &[u8]) -> Outcome {
        self.concat(key, tail, false)
    }

    /// Concatenate data in front of an existing value
    pub fn prepend(&self, key: &str, head: &[u8]) -> Outcome {
        self.concat(key, head, true)
    }

    fn concat(&self, key: &str, extra: &[u8], front: bool) -> Outcome {
        let mut inner = self.inner.write().unwrap();
        match inner.items.get(key) {
            None => return Outcome::NotStored,
            Some(item) if item.is_expired() => {
                inner.remove(key);
                return Outcome::NotStored;
            }
            Some(_) => {}
        }

        inner.make_room(extra.len(), self.max_memory);
        let cas = self.next_cas();
        // Under extreme pressure the target itself is the coldest item and
        // just got evicted.
        let Some(item) = inner.touch(key) else {
            return Outcome::NotStored;
        };
        let mut value = Vec::with_capacity(item.value.len() + extra.len());
        if front {
            value.extend_from_slice(extra);
            value.extend_from_slice(&item.value);
        } else {
            value.extend_from_slice(&item.value);
            value.extend_from_slice(extra);
        }
        item.value = Bytes::from(value);
        item.cas = cas;
        inner.memory_used += extra.len();
        Outcome::Stored
    }

    /// Increment a numeric value, wrapping on overflow
    pub fn incr(&self, key: &str, delta: u64) -> Outcome {
        self.arith(key, delta, false)
    }

    /// Decrement a numeric value, saturating at zero
    pub fn decr(&self, key: &str, delta: u64) -> Outcome {
        self.arith(key, delta, true)
    }

    fn arith(&self, key: &str, delta: u64, decrement: bool) -> Outcome {
        let mut inner = self.inner.write().unwrap();
        match inner.items.get(key) {
            Some(item) if !item.is_expired() => {}
            Some(_) => {
                inner.remove(key);
                return Outcome::NotFound;
            }
            None => return Outcome::NotFound,
        }

        let cas = self.next_cas();
        let Some(item) = inner.touch(key) else {
            return Outcome::NotFound;
        };
        let current: u64 = match std::str::from_utf8(&item.value)
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            Some(n) => n,
            None => return Outcome::NonNumeric,
        };

        let new = if decrement {
            current.saturating_sub(delta)
        } else {
            current.wrapping_add(delta)
        };

        let rendered = new.to_string();
        let old_len = item.value.len();
        let new_len = rendered.len();
        item.value = Bytes::from(rendered.into_bytes());
        item.cas = cas;
        if new_len >= old_len {
            inner.memory_used += new_len - old_len;
        } else {
            inner.memory_used -= old_len - new_len;
        }

        Outcome::Counter(new)
    }

    /// Remove all expired items; called periodically by the sweep thread
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.write().unwrap();
        let expired: Vec<String> = inner
            .items
            .iter()
            .filter(|(_, item)| item.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired items");
        }
        expired.len()
    }

    /// Drop every item
    pub fn flush_all(&self) -> Outcome {
        let mut inner = self.inner.write().unwrap();
        let dropped = inner.items.len();
        inner.items.clear();
        inner.by_access.clear();
        inner.memory_used = 0;
        info!(dropped, "Flushed all items");
        Outcome::Flushed
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read().unwrap();
        StoreStats {
            item_count: inner.items.len(),
            memory_used: inner.memory_used,
            max_memory: self.max_memory,
        }
    }
}

/// Point-in-time store statistics
#[derive(Debug)]
pub struct StoreStats {
    pub item_count: usize,
    pub memory_used: usize,
    pub max_memory: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn store() -> Arc<Store> {
        Store::new(1024 * 1024, 0)
    }

    #[test]
    fn test_basic_set_get() {
        let store = store();

        let result = store.set("key1", Bytes::from_static(b"value1"), 7, 0);
        assert_eq!(result, Outcome::Stored);

        let item = store.get("key1").unwrap();
        assert_eq!(item.value, Bytes::from_static(b"value1"));
        assert_eq!(item.flags, 7);
    }

    #[test]
    fn test_get_nonexistent() {
        assert!(store().get("nonexistent").is_none());
    }

    #[test]
    fn test_delete() {
        let store = store();

        store.set("key1", Bytes::from_static(b"value1"), 0, 0);
        assert_eq!(store.delete("key1"), Outcome::Deleted);
        assert!(store.get("key1").is_none());
        assert_eq!(store.delete("key1"), Outcome::NotFound);
    }

    #[test]
    fn test_add() {
        let store = store();

        assert_eq!(
            store.add("key1", Bytes::from_static(b"value1"), 0, 0),
            Outcome::Stored
        );
        assert_eq!(
            store.add("key1", Bytes::from_static(b"value2"), 0, 0),
            Outcome::NotStored
        );
        assert_eq!(store.get("key1").unwrap().value, Bytes::from_static(b"value1"));
    }

    #[test]
    fn test_replace() {
        let store = store();

        assert_eq!(
            store.replace("key1", Bytes::from_static(b"value1"), 0, 0),
            Outcome::NotStored
        );

        store.set("key1", Bytes::from_static(b"value1"), 0, 0);
        assert_eq!(
            store.replace("key1", Bytes::from_static(b"value2"), 0, 0),
            Outcome::Stored
        );
        assert_eq!(store.get("key1").unwrap().value, Bytes::from_static(b"value2"));
    }

    #[test]
    fn test_cas() {
        let store = store();

        store.set("key1", Bytes::from_static(b"value1"), 0, 0);
        let cas = store.get("key1").unwrap().cas;

        assert_eq!(
            store.cas("key1", Bytes::from_static(b"value2"), 0, 0, cas),
            Outcome::Stored
        );

        // The token rotated on store; the old one no longer matches.
        assert_eq!(
            store.cas("key1", Bytes::from_static(b"value3"), 0, 0, cas),
            Outcome::CasMismatch
        );
        assert_eq!(store.get("key1").unwrap().value, Bytes::from_static(b"value2"));

        assert_eq!(
            store.cas("missing", Bytes::from_static(b"v"), 0, 0, 1),
            Outcome::NotFound
        );
    }

    #[test]
    fn test_append_prepend() {
        let store = store();

        store.set("key1", Bytes::from_static(b"bird"), 0, 0);
        assert_eq!(store.append("key1", b"house"), Outcome::Stored);
        assert_eq!(store.prepend("key1", b"red "), Outcome::Stored);
        assert_eq!(
            store.get("key1").unwrap().value,
            Bytes::from_static(b"red birdhouse")
        );

        assert_eq!(store.append("missing", b"x"), Outcome::NotStored);
    }

    #[test]
    fn test_incr_decr() {
        let store = store();

        store.set("counter", Bytes::from_static(b"10"), 0, 0);
        assert_eq!(store.incr("counter", 5), Outcome::Counter(15));
        assert_eq!(store.decr("counter", 20), Outcome::Counter(0));
        assert_eq!(store.get("counter").unwrap().value, Bytes::from_static(b"0"));

        assert_eq!(store.incr("missing", 1), Outcome::NotFound);

        store.set("text", Bytes::from_static(b"abc"), 0, 0);
        assert_eq!(store.incr("text", 1), Outcome::NonNumeric);
    }

    #[test]
    fn test_expiration() {
        let store = store();

        store.set("key1", Bytes::from_static(b"value1"), 0, 1);
        assert!(store.get("key1").is_some());

        thread::sleep(Duration::from_millis(1100));
        assert!(store.get("key1").is_none());
    }

    #[test]
    fn test_absolute_timestamp_expiry() {
        let store = store();

        // An absolute timestamp in the past expires immediately.
        let past = (Utc::now().timestamp() - 60) as u64;
        store.set("old", Bytes::from_static(b"v"), 0, past);
        assert!(store.get("old").is_none());

        // One comfortably in the future stays alive.
        let future = (Utc::now().timestamp() + 3600) as u64;
        store.set("new", Bytes::from_static(b"v"), 0, future);
        assert!(store.get("new").is_some());
    }

    #[test]
    fn test_memory_limit_eviction() {
        let store = Store::new(500, 0);

        for i in 0..20 {
            let key = format!("key{i}");
            store.set(&key, Bytes::from(vec![0u8; 50]), 0, 0);
        }

        let stats = store.stats();
        assert!(stats.memory_used <= 500);
        assert!(stats.item_count < 20);
    }

    #[test]
    fn test_eviction_prefers_coldest() {
        let store = Store::new(1000, 0);

        store.set("cold", Bytes::from(vec![0u8; 80]), 0, 0);
        store.set("warm", Bytes::from(vec![0u8; 80]), 0, 0);
        store.get("warm");

        // This insert forces an eviction; the untouched key must go first.
        store.set("hot", Bytes::from(vec![0u8; 700]), 0, 0);
        assert!(store.get("cold").is_none());
        assert!(store.get("warm").is_some());
        assert!(store.get("hot").is_some());
    }

    #[test]
    fn test_cas_respects_memory_limit() {
        let store = Store::new(4096, 0);

        store.set("old", Bytes::from(vec![0u8; 100]), 0, 0);
        store.set("target", Bytes::from(vec![0u8; 100]), 0, 0);
        let cas = store.get("target").unwrap().cas;

        // Replacing with a near-capacity value must evict, not overshoot.
        assert_eq!(
            store.cas("target", Bytes::from(vec![0u8; 3800]), 0, 0, cas),
            Outcome::Stored
        );
        assert!(store.get("old").is_none());
        assert_eq!(store.get("target").unwrap().value.len(), 3800);
        assert!(store.stats().memory_used <= 4096);
    }

    #[test]
    fn test_append_respects_memory_limit() {
        let store = Store::new(2048, 0);

        store.set("pad", Bytes::from(vec![0u8; 100]), 0, 0);
        store.set("log", Bytes::from_static(b"x"), 0, 0);

        // Growing far past capacity must keep evicting, never overshoot.
        for _ in 0..100 {
            store.append("log", &[b'y'; 64]);
        }
        assert!(store.stats().memory_used <= 2048);
        assert!(store.get("pad").is_none());
    }

    #[test]
    fn test_flush_all() {
        let store = store();

        store.set("key1", Bytes::from_static(b"value1"), 0, 0);
        store.set("key2", Bytes::from_static(b"value2"), 0, 0);

        assert_eq!(store.flush_all(), Outcome::Flushed);
        assert!(store.get("key1").is_none());

        let stats = store.stats();
        assert_eq!(stats.item_count, 0);
        assert_eq!(stats.memory_used, 0);
    }

    #[test]
    fn test_cleanup_expired() {
        let store = store();

        store.set("stays", Bytes::from_static(b"v"), 0, 0);
        store.set("goes", Bytes::from_static(b"v"), 0, 1);
        thread::sleep(Duration::from_millis(1100));

        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.stats().item_count, 1);
        assert!(store.get("stays").is_some());
    }
}
