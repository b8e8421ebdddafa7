//! Cache entry representation shared by all storage layers
//!
//! An entry owns a JSON payload plus the expiration and access metadata the
//! memory layer needs for eviction decisions. Entries are value-copied when
//! they move between layers; only the in-process memory layer mutates the
//! access-time bookkeeping, and it does so through atomics so readers never
//! take a write lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;

/// Milliseconds since UNIX epoch.
///
/// Truncation to `u64` is safe: epoch-ms fits comfortably for centuries.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn epoch_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
fn duration_millis(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

/// A single cached value with expiration and access metadata
#[derive(Debug)]
pub struct CacheEntry {
    /// Cached JSON payload
    value: Value,
    /// Tags carried by this entry
    tags: Vec<String>,
    /// Sliding-expiration window; a read extends the expiry by this much
    sliding: Option<Duration>,
    /// Creation timestamp (epoch ms)
    created_ms: u64,
    /// Current expiration timestamp (epoch ms); moved forward by sliding reads
    expires_ms: AtomicU64,
    /// Upper bound the sliding window can never extend past (epoch ms)
    hard_expires_ms: u64,
    /// Last access timestamp (epoch ms), updated on every read
    last_access_ms: AtomicU64,
    /// Number of reads served from this entry
    access_count: AtomicU64,
    /// Estimated size in bytes, assigned by the memory layer on insert
    size: u64,
}

impl CacheEntry {
    /// Create an entry expiring `ttl` from now.
    ///
    /// A zero `ttl` produces an entry that is already expired for every
    /// subsequent read; the caller that created it may still hand the value
    /// to its own in-flight request.
    #[must_use]
    pub fn new(value: Value, ttl: Duration, sliding: Option<Duration>, tags: Vec<String>) -> Self {
        let now = epoch_millis_now();
        let expires = now.saturating_add(duration_millis(ttl));
        Self {
            value,
            tags,
            sliding,
            created_ms: now,
            expires_ms: AtomicU64::new(expires),
            hard_expires_ms: expires,
            last_access_ms: AtomicU64::new(now),
            access_count: AtomicU64::new(0),
            size: 0,
        }
    }

    /// Re-lease the entry for `ttl` from now, dropping any previous expiry.
    ///
    /// Used when an entry is promoted or written into a layer with a clamped
    /// TTL; the sliding window is preserved but can never extend past the new
    /// lease.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        let now = epoch_millis_now();
        let expires = now.saturating_add(duration_millis(ttl));
        self.expires_ms = AtomicU64::new(expires);
        self.hard_expires_ms = expires;
        self
    }

    /// Cached payload
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consume the entry, returning the payload
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Tags carried by this entry
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Whether the entry has passed its expiration timestamp
    #[must_use]
    pub fn is_expired(&self) -> bool {
        epoch_millis_now() >= self.expires_ms.load(Ordering::Relaxed)
    }

    /// Time left until expiry (zero when already expired)
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        let now = epoch_millis_now();
        let expires = self.expires_ms.load(Ordering::Relaxed);
        Duration::from_millis(expires.saturating_sub(now))
    }

    /// Record a read: bump the access count, refresh the last-access time,
    /// and extend a sliding expiry (never past the hard bound).
    pub fn touch(&self) {
        let now = epoch_millis_now();
        self.last_access_ms.store(now, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
        if let Some(window) = self.sliding {
            let extended = now
                .saturating_add(duration_millis(window))
                .min(self.hard_expires_ms);
            self.expires_ms.fetch_max(extended, Ordering::Relaxed);
        }
    }

    /// Creation timestamp (epoch ms)
    #[must_use]
    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    /// Last access timestamp (epoch ms)
    #[must_use]
    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// Number of reads served from this entry
    #[must_use]
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Estimated size in bytes
    #[must_use]
    pub fn size_estimate(&self) -> u64 {
        self.size
    }

    pub(crate) fn set_size_estimate(&mut self, size: u64) {
        self.size = size;
    }
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            tags: self.tags.clone(),
            sliding: self.sliding,
            created_ms: self.created_ms,
            expires_ms: AtomicU64::new(self.expires_ms.load(Ordering::Relaxed)),
            hard_expires_ms: self.hard_expires_ms,
            last_access_ms: AtomicU64::new(self.last_access_ms.load(Ordering::Relaxed)),
            access_count: AtomicU64::new(self.access_count.load(Ordering::Relaxed)),
            size: self.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_entry_is_not_expired() {
        let entry = CacheEntry::new(json!(1), Duration::from_secs(60), None, vec![]);
        assert!(!entry.is_expired());
        assert!(entry.remaining_ttl() > Duration::from_secs(59));
    }

    #[test]
    fn zero_ttl_entry_is_expired_for_subsequent_reads() {
        let entry = CacheEntry::new(json!(1), Duration::ZERO, None, vec![]);
        assert!(entry.is_expired());
        assert_eq!(entry.remaining_ttl(), Duration::ZERO);
    }

    #[test]
    fn touch_updates_access_bookkeeping() {
        let entry = CacheEntry::new(json!("v"), Duration::from_secs(60), None, vec![]);
        assert_eq!(entry.access_count(), 0);
        entry.touch();
        entry.touch();
        assert_eq!(entry.access_count(), 2);
        assert!(entry.last_access_ms() >= entry.created_ms());
    }

    #[test]
    fn sliding_read_extends_expiry_but_not_past_hard_bound() {
        // GIVEN: 100ms ttl with a 100ms sliding window
        let entry = CacheEntry::new(
            json!(1),
            Duration::from_millis(100),
            Some(Duration::from_millis(100)),
            vec![],
        );
        let before = entry.remaining_ttl();

        // WHEN: the entry is touched
        entry.touch();

        // THEN: expiry may move forward but never past created + ttl
        let after = entry.remaining_ttl();
        assert!(after >= before.saturating_sub(Duration::from_millis(5)));
        assert!(after <= Duration::from_millis(100));
    }

    #[test]
    fn with_ttl_re_leases_from_now() {
        let entry = CacheEntry::new(json!(1), Duration::from_secs(3600), None, vec![]);
        let clamped = entry.with_ttl(Duration::from_secs(10));
        assert!(clamped.remaining_ttl() <= Duration::from_secs(10));
        assert!(!clamped.is_expired());
    }

    #[test]
    fn clone_copies_metadata() {
        let entry = CacheEntry::new(json!({"id": 1}), Duration::from_secs(60), None, vec!["users".into()]);
        entry.touch();
        let copy = entry.clone();
        assert_eq!(copy.value(), entry.value());
        assert_eq!(copy.tags(), entry.tags());
        assert_eq!(copy.access_count(), 1);
    }
}
