use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::clock::to_chrono;

/// A stored cache record.
///
/// Entries are never mutated in place apart from their access tick; a new
/// write replaces the whole entry.
#[derive(Debug)]
pub struct CacheEntry {
    pub(crate) payload: Vec<u8>,
    checksum: String,
    written_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    size: usize,
    /// Write sequence number, used to avoid removing a newer entry for the
    /// same key after a stale read.
    pub(crate) generation: u64,
    last_access: AtomicU64,
}

impl CacheEntry {
    pub(crate) fn new(
        key: &str,
        payload: Vec<u8>,
        written_at: DateTime<Utc>,
        ttl: Duration,
        generation: u64,
    ) -> Self {
        let checksum = checksum(&payload);
        let size = key.len() + payload.len();

        Self {
            payload,
            checksum,
            written_at,
            expires_at: written_at + to_chrono(ttl),
            size,
            generation,
            last_access: AtomicU64::new(generation),
        }
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn written_at(&self) -> DateTime<Utc> {
        self.written_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Accounted size in bytes (key plus stored payload).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whether the stored payload still matches the checksum taken at write.
    pub fn verify(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

/// SHA-256 of `bytes`, hex encoded.
pub(crate) fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_entry_freshness_boundary() {
        let written = DateTime::<Utc>::UNIX_EPOCH;
        let entry = CacheEntry::new("k", b"v".to_vec(), written, Duration::from_millis(100), 1);

        assert!(entry.is_fresh(written + chrono::Duration::milliseconds(99)));
        assert!(!entry.is_fresh(written + chrono::Duration::milliseconds(100)));
        assert_eq!(entry.size(), 2);
        assert!(entry.verify());
    }

    #[test]
    fn test_touch_only_moves_forward() {
        let entry = CacheEntry::new(
            "k",
            Vec::new(),
            DateTime::<Utc>::UNIX_EPOCH,
            Duration::from_secs(1),
            5,
        );
        entry.touch(9);
        entry.touch(7);
        assert_eq!(entry.last_access(), 9);
    }
}
