//! Integrity-checked, size-bounded cache with TTL expiry.
//!
//! Values are serialized with `serde_json`, passed through an [`EntryCodec`]
//! and stored together with a SHA-256 checksum of the stored bytes. A read
//! only ever returns a value that is unexpired, matches its checksum and
//! decodes cleanly; anything else is deleted and reported as a miss.
//!
//! # Eviction
//!
//! The store tracks the total size of its entries. When a write pushes the
//! total over the configured ceiling, least recently used entries are evicted
//! until the total is at or below 80% of the ceiling.
//!
//! # Concurrency
//!
//! Entries live in a sharded [`DashMap`], so readers and writers of different
//! keys do not contend on a single lock.

mod codec;
mod entry;

pub use codec::{EntryCodec, IdentityCodec};
pub use entry::CacheEntry;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;

/// Share of the ceiling that eviction brings the store back down to.
const EVICTION_TARGET_PERCENT: usize = 80;

/// Errors raised inside the cache.
///
/// Read-side failures never reach callers of [`CacheStore::get`]; they are
/// logged and the offending entry is removed.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum CacheError {
    #[error("failed to serialize cache value: {0}")]
    Serialize(String),

    #[error("cache codec failed: {0}")]
    Codec(String),

    #[error("cache entry '{key}' is corrupted: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("cache entry '{key}' is {size} bytes, over the {max} byte ceiling")]
    TooLarge { key: String, size: usize, max: usize },

    #[error("invalid cache key pattern: {0}")]
    InvalidPattern(String),
}

/// Result of [`CacheStore::lookup`].
#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup<V> {
    /// Unexpired and intact.
    Fresh(V),
    /// Intact but past its expiry. Kept for degraded reads.
    Stale(V),
    Miss,
}

impl<V> CacheLookup<V> {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

/// Point-in-time cache counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub corruptions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub size_bytes: usize,
    pub max_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    corruptions: AtomicU64,
    expirations: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

enum Probe<V> {
    Hit(V),
    Missing,
    Expired(u64),
    Corrupt(u64, CacheError),
}

/// Typed key-value cache.
pub struct CacheStore<V> {
    entries: DashMap<String, CacheEntry>,
    size_bytes: AtomicUsize,
    max_bytes: usize,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn EntryCodec>,
    tick: AtomicU64,
    evicting: AtomicBool,
    counters: Counters,
    _value: PhantomData<fn() -> V>,
}

impl<V> CacheStore<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(max_bytes: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            size_bytes: AtomicUsize::new(0),
            max_bytes,
            clock,
            codec: Arc::new(IdentityCodec),
            tick: AtomicU64::new(0),
            evicting: AtomicBool::new(false),
            counters: Counters::default(),
            _value: PhantomData,
        }
    }

    /// Replace the storage codec. Existing entries are not re-encoded.
    pub fn with_codec(mut self, codec: Arc<dyn EntryCodec>) -> Self {
        debug!("Cache using '{}' codec", codec.name());
        self.codec = codec;
        self
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get a fresh value. Expired and corrupted entries are removed.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();

        let probe = match self.entries.get(key) {
            None => Probe::Missing,
            Some(entry) if !entry.is_fresh(now) => Probe::Expired(entry.generation),
            Some(entry) => match self.decode(key, &entry) {
                Ok(value) => {
                    entry.touch(self.next_tick());
                    Probe::Hit(value)
                }
                Err(error) => Probe::Corrupt(entry.generation, error),
            },
        };

        match probe {
            Probe::Hit(value) => {
                bump(&self.counters.hits, 1);
                Some(value)
            }
            Probe::Missing => {
                bump(&self.counters.misses, 1);
                None
            }
            Probe::Expired(generation) => {
                if self.remove_generation(key, generation) {
                    bump(&self.counters.expirations, 1);
                }
                bump(&self.counters.misses, 1);
                None
            }
            Probe::Corrupt(generation, error) => {
                self.heal(key, generation, &error);
                bump(&self.counters.misses, 1);
                None
            }
        }
    }

    /// Like [`get`](Self::get), but hands back intact expired values as
    /// [`CacheLookup::Stale`] instead of deleting them.
    pub fn lookup(&self, key: &str) -> CacheLookup<V> {
        let now = self.clock.now();

        let probe = match self.entries.get(key) {
            None => None,
            Some(entry) => {
                let fresh = entry.is_fresh(now);
                match self.decode(key, &entry) {
                    Ok(value) => {
                        if fresh {
                            entry.touch(self.next_tick());
                        }
                        Some(Ok((value, fresh)))
                    }
                    Err(error) => Some(Err((entry.generation, error))),
                }
            }
        };

        match probe {
            Some(Ok((value, true))) => {
                bump(&self.counters.hits, 1);
                CacheLookup::Fresh(value)
            }
            Some(Ok((value, false))) => {
                bump(&self.counters.misses, 1);
                CacheLookup::Stale(value)
            }
            Some(Err((generation, error))) => {
                self.heal(key, generation, &error);
                bump(&self.counters.misses, 1);
                CacheLookup::Miss
            }
            None => {
                bump(&self.counters.misses, 1);
                CacheLookup::Miss
            }
        }
    }

    /// Fresh values for every key that has one.
    pub fn get_many<I, K>(&self, keys: I) -> HashMap<String, V>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        keys.into_iter()
            .filter_map(|key| {
                let key = key.as_ref();
                self.get(key).map(|value| (key.to_string(), value))
            })
            .collect()
    }

    /// Store a value for `ttl`. Replaces any previous entry for the key.
    pub fn set(&self, key: impl Into<String>, value: &V, ttl: Duration) -> Result<(), CacheError> {
        let key = key.into();
        let plain = serde_json::to_vec(value).map_err(|e| CacheError::Serialize(e.to_string()))?;
        let payload = self.codec.encode(plain)?;

        let size = key.len() + payload.len();
        if size > self.max_bytes {
            warn!(
                "Rejecting cache entry '{}': {} bytes exceeds ceiling of {} bytes",
                key, size, self.max_bytes
            );
            return Err(CacheError::TooLarge {
                key,
                size,
                max: self.max_bytes,
            });
        }

        let entry = CacheEntry::new(&key, payload, self.clock.now(), ttl, self.next_tick());
        self.size_bytes.fetch_add(entry.size(), Ordering::Relaxed);
        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            self.size_bytes.fetch_sub(previous.size(), Ordering::Relaxed);
        }

        self.evict_if_needed(&key);
        Ok(())
    }

    /// Store several values with the same TTL. Returns how many were written;
    /// rejected values are logged and skipped.
    pub fn set_many<I>(&self, items: I, ttl: Duration) -> usize
    where
        I: IntoIterator<Item = (String, V)>,
    {
        let mut written = 0;
        for (key, value) in items {
            match self.set(key, &value, ttl) {
                Ok(()) => written += 1,
                Err(e) => debug!("Skipping cache write: {}", e),
            }
        }
        written
    }

    pub fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.size_bytes.fetch_sub(entry.size(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove(&key);
        }
        debug!("Cache cleared");
    }

    /// Remove every key starting with `prefix`.
    pub fn clear_namespace(&self, prefix: &str) -> usize {
        self.remove_where(|key| key.starts_with(prefix))
    }

    /// Remove every key matching a glob (`*` any run, `?` one character).
    pub fn clear_pattern(&self, glob: &str) -> Result<usize, CacheError> {
        let regex = glob_to_regex(glob)?;
        Ok(self.remove_where(|key| regex.is_match(key)))
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| !e.is_fresh(now))
            .map(|e| (e.key().clone(), e.generation))
            .collect();

        let removed = expired
            .into_iter()
            .filter(|(key, generation)| self.remove_generation(key, *generation))
            .count();

        if removed > 0 {
            bump(&self.counters.expirations, removed as u64);
            debug!("Purged {} expired cache entries", removed);
        }
        removed
    }

    /// Expiry time of the entry under `key`, if present.
    pub fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|e| e.expires_at())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            corruptions: self.counters.corruptions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: self.len(),
            size_bytes: self.size_bytes(),
            max_bytes: self.max_bytes,
        }
    }

    fn decode(&self, key: &str, entry: &CacheEntry) -> Result<V, CacheError> {
        let corrupted = |reason: String| CacheError::Corrupted {
            key: key.to_string(),
            reason,
        };

        if !entry.verify() {
            return Err(corrupted("checksum mismatch".to_string()));
        }

        let plain = self
            .codec
            .decode(&entry.payload)
            .map_err(|e| corrupted(e.to_string()))?;

        serde_json::from_slice(&plain).map_err(|e| corrupted(e.to_string()))
    }

    fn heal(&self, key: &str, generation: u64, error: &CacheError) {
        warn!("{}; removing entry", error);
        if self.remove_generation(key, generation) {
            bump(&self.counters.corruptions, 1);
        }
    }

    /// Remove `key` only if it still holds the entry written as `generation`.
    fn remove_generation(&self, key: &str, generation: u64) -> bool {
        match self.entries.remove_if(key, |_, e| e.generation == generation) {
            Some((_, entry)) => {
                self.size_bytes.fetch_sub(entry.size(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn remove_where(&self, matches: impl Fn(&str) -> bool) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| matches(e.key()))
            .map(|e| e.key().clone())
            .collect();

        keys.iter().filter(|key| self.remove(key)).count()
    }

    fn evict_if_needed(&self, protect: &str) {
        let target = self.max_bytes.saturating_mul(EVICTION_TARGET_PERCENT) / 100;

        // Re-checked after each pass to pick up writes made while another
        // thread held the flag.
        while self.size_bytes() > self.max_bytes {
            // One evictor at a time; the running pass re-checks when done.
            if self
                .evicting
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return;
            }

            let mut candidates: Vec<(u64, String, u64)> = self
                .entries
                .iter()
                .filter(|e| e.key() != protect)
                .map(|e| (e.last_access(), e.key().clone(), e.generation))
                .collect();
            candidates.sort_unstable_by_key(|(tick, _, _)| *tick);
            let exhausted = candidates.is_empty();

            let mut evicted = 0u64;
            for (_, key, generation) in candidates {
                if self.size_bytes() <= target {
                    break;
                }
                if self.remove_generation(&key, generation) {
                    evicted += 1;
                }
            }

            self.evicting.store(false, Ordering::Release);

            if evicted > 0 {
                bump(&self.counters.evictions, evicted);
                debug!(
                    "Evicted {} cache entries, size now {} of {} bytes",
                    evicted,
                    self.size_bytes(),
                    self.max_bytes
                );
            }
            if exhausted {
                return;
            }
        }
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex, CacheError> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    let mut buf = [0u8; 4];
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    pattern.push('$');

    Regex::new(&pattern).map_err(|e| CacheError::InvalidPattern(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    const TTL: Duration = Duration::from_millis(60_000);

    fn store(max_bytes: usize) -> (CacheStore<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        (CacheStore::new(max_bytes, clock.clone()), clock)
    }

    /// Codec that XORs every byte, so stored bytes differ from JSON.
    struct XorCodec;

    impl EntryCodec for XorCodec {
        fn name(&self) -> &str {
            "xor"
        }

        fn encode(&self, plain: Vec<u8>) -> Result<Vec<u8>, CacheError> {
            Ok(plain.into_iter().map(|b| b ^ 0x5a).collect())
        }

        fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CacheError> {
            Ok(stored.iter().map(|b| b ^ 0x5a).collect())
        }
    }

    /// Codec whose decode always fails.
    struct BrokenCodec;

    impl EntryCodec for BrokenCodec {
        fn name(&self) -> &str {
            "broken"
        }

        fn encode(&self, plain: Vec<u8>) -> Result<Vec<u8>, CacheError> {
            Ok(plain)
        }

        fn decode(&self, _stored: &[u8]) -> Result<Vec<u8>, CacheError> {
            Err(CacheError::Codec("bad key".to_string()))
        }
    }

    #[test]
    fn test_ttl_boundary() {
        let (cache, clock) = store(1024);
        cache.set("k", &"v".to_string(), TTL).unwrap();

        clock.advance(Duration::from_millis(59_999));
        assert_eq!(cache.get("k"), Some("v".to_string()));

        clock.advance(Duration::from_millis(2));
        assert_eq!(cache.get("k"), None);
        assert!(!cache.contains_key("k"));
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_checksum_mismatch_heals() {
        let (cache, _) = store(1024);
        cache.set("k", &"value".to_string(), TTL).unwrap();

        if let Some(mut entry) = cache.entries.get_mut("k") {
            entry.payload[1] ^= 0xff;
        }

        assert_eq!(cache.get("k"), None);
        assert!(!cache.contains_key("k"));
        assert_eq!(cache.size_bytes(), 0);

        let stats = cache.stats();
        assert_eq!(stats.corruptions, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_decode_failure_heals() {
        let (cache, _) = store(1024);
        let cache = cache.with_codec(Arc::new(BrokenCodec));
        cache.set("k", &"value".to_string(), TTL).unwrap();

        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().corruptions, 1);
    }

    #[test]
    fn test_codec_round_trip_and_checksum_over_stored_bytes() {
        let (cache, _) = store(1024);
        let cache = cache.with_codec(Arc::new(XorCodec));
        cache.set("k", &"value".to_string(), TTL).unwrap();

        {
            let entry = cache.entries.get("k").unwrap();
            assert_ne!(entry.payload, serde_json::to_vec("value").unwrap());
            assert_eq!(entry.checksum(), entry::checksum(&entry.payload));
        }
        assert_eq!(cache.get("k"), Some("value".to_string()));
    }

    #[test]
    fn test_lookup_returns_stale_without_deleting() {
        let (cache, clock) = store(1024);
        cache.set("k", &"old".to_string(), TTL).unwrap();

        assert_eq!(cache.lookup("k"), CacheLookup::Fresh("old".to_string()));

        clock.advance(Duration::from_millis(60_001));
        assert_eq!(cache.lookup("k"), CacheLookup::Stale("old".to_string()));
        assert!(cache.contains_key("k"));

        // A plain get still refuses and removes it.
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.lookup("k"), CacheLookup::Miss);
    }

    #[test]
    fn test_overwrite_replaces_size() {
        let (cache, _) = store(1024);
        cache.set("k", &"aaaa".to_string(), TTL).unwrap();
        let first = cache.size_bytes();
        cache.set("k", &"aa".to_string(), TTL).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_bytes(), first - 2);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let (cache, _) = store(16);
        let err = cache.set("k", &"x".repeat(64), TTL).unwrap_err();
        assert!(matches!(err, CacheError::TooLarge { max: 16, .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction_is_lru_down_to_eighty_percent() {
        // Each entry: 2-byte key + 12-byte JSON string = 14 bytes.
        let (cache, _) = store(100);
        for i in 0..7 {
            cache.set(format!("k{}", i), &"0123456789".to_string(), TTL).unwrap();
        }
        assert_eq!(cache.size_bytes(), 98);

        // Touch k0 so k1 becomes least recently used.
        assert!(cache.get("k0").is_some());

        cache.set("k7", &"0123456789".to_string(), TTL).unwrap();

        assert!(cache.size_bytes() <= 80);
        assert!(cache.contains_key("k0"));
        assert!(cache.contains_key("k7"));
        assert!(!cache.contains_key("k1"));
        assert!(!cache.contains_key("k2"));
        assert_eq!(cache.stats().evictions, 3);
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn test_concurrent_writers_stay_within_ceiling() {
        let (cache, _) = store(512);

        std::thread::scope(|scope| {
            for writer in 0..8 {
                let cache = &cache;
                scope.spawn(move || {
                    for i in 0..200 {
                        let _ = cache.set(format!("w{}-{}", writer, i), &"0123456789".to_string(), TTL);
                    }
                });
            }
        });

        assert!(cache.size_bytes() <= 512);
        let accounted: usize = cache.entries.iter().map(|e| e.size()).sum();
        assert_eq!(accounted, cache.size_bytes());
    }

    #[test]
    fn test_clear_namespace_and_pattern() {
        let (cache, _) = store(4096);
        for key in ["A:quote:AAPL", "A:quote:MSFT", "B:quote:AAPL", "B:search:apple"] {
            cache.set(key, &"v".to_string(), TTL).unwrap();
        }

        assert_eq!(cache.clear_namespace("A:"), 2);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.clear_pattern("*:quote:*").unwrap(), 1);
        assert!(cache.contains_key("B:search:apple"));

        assert_eq!(cache.clear_pattern("B:s?arch:apple").unwrap(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_pattern_escapes_regex_metacharacters() {
        let (cache, _) = store(4096);
        cache.set("a.b", &"v".to_string(), TTL).unwrap();
        cache.set("axb", &"v".to_string(), TTL).unwrap();

        assert_eq!(cache.clear_pattern("a.b").unwrap(), 1);
        assert!(cache.contains_key("axb"));
    }

    #[test]
    fn test_purge_expired() {
        let (cache, clock) = store(4096);
        cache.set("short", &"v".to_string(), Duration::from_secs(1)).unwrap();
        cache.set("long", &"v".to_string(), Duration::from_secs(100)).unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.contains_key("long"));
        assert!(!cache.contains_key("short"));
    }

    #[test]
    fn test_get_many_and_set_many() {
        let (cache, _) = store(4096);
        let written = cache.set_many(
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ],
            TTL,
        );
        assert_eq!(written, 2);

        let found = cache.get_many(["a", "b", "c"]);
        assert_eq!(found.len(), 2);
        assert_eq!(found.get("b"), Some(&"2".to_string()));
    }

    #[test]
    fn test_clear_resets_size() {
        let (cache, _) = store(4096);
        cache.set("a", &"1".to_string(), TTL).unwrap();
        cache.set("b", &"2".to_string(), TTL).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_stats_hit_rate() {
        let (cache, _) = store(4096);
        cache.set("a", &"1".to_string(), TTL).unwrap();
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn prop_get_never_returns_expired(ttl_ms in 1u64..100_000, elapsed_ms in 0u64..200_000) {
            let (cache, clock) = store(4096);
            cache.set("k", &"v".to_string(), Duration::from_millis(ttl_ms)).unwrap();
            clock.advance(Duration::from_millis(elapsed_ms));

            let got = cache.get("k");
            prop_assert_eq!(got.is_some(), elapsed_ms < ttl_ms);
        }

        #[test]
        fn prop_size_stays_within_ceiling(values in proptest::collection::vec("[a-z]{0,40}", 1..60)) {
            let (cache, _) = store(256);
            for (i, value) in values.iter().enumerate() {
                let _ = cache.set(format!("key{}", i % 17), value, TTL);
                prop_assert!(cache.size_bytes() <= 256);
            }

            let accounted: usize = cache.entries.iter().map(|e| e.size()).sum();
            prop_assert_eq!(accounted, cache.size_bytes());
        }
    }
}
