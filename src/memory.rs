//! In-process memory layer (L1)
//!
//! A bounded concurrent map of cache entries with TTL enforcement on every
//! read, approximate-LRU eviction when entry-count or byte thresholds are
//! exceeded, and a background expiry sweep. Expired entries are never
//! returned; they are evicted on the read that finds them and by the sweep.
//!
//! Size accounting is a monotonic estimate, not an exact measurement. The
//! estimator mode decides the cost paid per write: `fast` never serializes,
//! `sampling` measures every Nth write and extrapolates, `accurate`
//! serializes on a throttle, `disabled` reports zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::{EstimatorMode, MemoryConfig};
use crate::entry::CacheEntry;

/// Fixed per-entry bookkeeping overhead used by the fast estimator
const ENTRY_OVERHEAD: u64 = 80;

/// Bounded in-process cache map with TTL and approximate-LRU eviction
pub struct MemoryLayer {
    entries: DashMap<String, Arc<CacheEntry>>,
    config: MemoryConfig,
    /// Estimated total byte size
    bytes: AtomicU64,
    /// Capacity evictions (count or byte pressure)
    evictions: AtomicU64,
    /// Expiry evictions (read-path and sweep)
    expired_evictions: AtomicU64,
    /// Write-operation counter driving the sampling/accurate throttles
    ops: AtomicU64,
    /// Moving average entry size maintained by the sampling estimator
    sampled_avg: AtomicU64,
}

/// Snapshot of memory-layer statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    /// Live entry count
    pub entries: usize,
    /// Estimated total byte size
    pub bytes: u64,
    /// Capacity evictions since creation
    pub evictions: u64,
    /// Expiry evictions since creation
    pub expired_evictions: u64,
}

impl MemoryLayer {
    /// Create an empty layer with the given bounds
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            bytes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_evictions: AtomicU64::new(0),
            ops: AtomicU64::new(0),
            sampled_avg: AtomicU64::new(0),
        }
    }

    /// Upper bound for entry TTLs in this layer
    #[must_use]
    pub fn max_ttl(&self) -> Duration {
        self.config.max_ttl
    }

    /// Get a live entry, recording the access.
    ///
    /// An expired entry is evicted and reported as absent.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            let size = entry.size_estimate();
            drop(entry);
            if self.entries.remove(key).is_some() {
                self.bytes.fetch_sub(size, Ordering::Relaxed);
                self.expired_evictions.fetch_add(1, Ordering::Relaxed);
            }
            return None;
        }
        entry.touch();
        Some(Arc::clone(entry.value()))
    }

    /// Insert or replace an entry, then enforce capacity bounds
    pub fn set(&self, key: String, mut entry: CacheEntry) {
        let size = self.estimate(&key, &entry);
        entry.set_size_estimate(size);

        if let Some(old) = self.entries.insert(key, Arc::new(entry)) {
            self.bytes.fetch_sub(old.size_estimate(), Ordering::Relaxed);
        }
        self.bytes.fetch_add(size, Ordering::Relaxed);

        self.maybe_evict();
    }

    /// Remove one entry; returns whether it was present
    pub fn remove(&self, key: &str) -> bool {
        if let Some((_, old)) = self.entries.remove(key) {
            self.bytes.fetch_sub(old.size_estimate(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Remove every entry carrying `tag`; returns the removed keys
    pub fn remove_by_tag(&self, tag: &str) -> Vec<String> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().tags().iter().any(|t| t == tag))
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
        self.bytes.store(0, Ordering::Relaxed);
    }

    /// Live entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the layer holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            entries: self.entries.len(),
            bytes: self.bytes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_evictions: self.expired_evictions.load(Ordering::Relaxed),
        }
    }

    /// Evict all expired entries (background maintenance)
    pub fn sweep(&self) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter_map(|e| e.value().is_expired().then(|| e.key().clone()))
            .collect();
        let count = stale.len();
        for key in &stale {
            if self.remove(key) {
                self.expired_evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        if count > 0 {
            debug!(count, "Swept expired cache entries");
        }
    }

    /// Spawn a background sweep task.
    ///
    /// The task runs every `sweep_interval` and stops once the layer's `Arc`
    /// reference count drops to 1 (all other owners released).
    pub fn spawn_sweep(layer: Arc<Self>) {
        let interval = layer.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if Arc::strong_count(&layer) <= 1 {
                    break;
                }
                layer.sweep();
            }
        });
    }

    /// Approximate-LRU eviction: expired entries first, then the least
    /// recently accessed, until both bounds are satisfied.
    fn maybe_evict(&self) {
        let over_count = self.entries.len() > self.config.max_entries;
        let over_bytes = self.bytes.load(Ordering::Relaxed) > self.config.max_bytes;
        if !over_count && !over_bytes {
            return;
        }

        let mut candidates: Vec<(String, bool, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().is_expired(), e.value().last_access_ms()))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        for (key, _, _) in candidates {
            let within_count = self.entries.len() <= self.config.max_entries;
            let within_bytes = self.bytes.load(Ordering::Relaxed) <= self.config.max_bytes;
            if within_count && within_bytes {
                break;
            }
            if self.remove(&key) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ── size estimation ───────────────────────────────────────────────────

    fn estimate(&self, key: &str, entry: &CacheEntry) -> u64 {
        let op = self.ops.fetch_add(1, Ordering::Relaxed);
        let every = self.config.estimator_every.max(1);
        match self.config.estimator {
            EstimatorMode::Disabled => 0,
            EstimatorMode::Fast => fast_estimate(key, entry),
            EstimatorMode::Sampling => {
                if op % every == 0 {
                    let measured = serialized_estimate(key, entry);
                    // Exponential moving average, weight 1/8 to the sample
                    let avg = self.sampled_avg.load(Ordering::Relaxed);
                    let next = if avg == 0 {
                        measured
                    } else {
                        (avg * 7 + measured) / 8
                    };
                    self.sampled_avg.store(next, Ordering::Relaxed);
                    next
                } else {
                    let avg = self.sampled_avg.load(Ordering::Relaxed);
                    if avg == 0 {
                        fast_estimate(key, entry)
                    } else {
                        avg
                    }
                }
            }
            EstimatorMode::Accurate => {
                if op % every == 0 {
                    serialized_estimate(key, entry)
                } else {
                    fast_estimate(key, entry)
                }
            }
        }
    }
}

/// Shallow per-type estimate; never serializes
fn fast_estimate(key: &str, entry: &CacheEntry) -> u64 {
    let value_size = match entry.value() {
        serde_json::Value::Null | serde_json::Value::Bool(_) => 8,
        serde_json::Value::Number(_) => 16,
        serde_json::Value::String(s) => 24 + s.len() as u64,
        serde_json::Value::Array(a) => 48 + 16 * a.len() as u64,
        serde_json::Value::Object(o) => 48 + 32 * o.len() as u64,
    };
    let tag_size: u64 = entry.tags().iter().map(|t| 24 + t.len() as u64).sum();
    ENTRY_OVERHEAD + key.len() as u64 + value_size + tag_size
}

/// Serialize-and-measure estimate
fn serialized_estimate(key: &str, entry: &CacheEntry) -> u64 {
    let payload = serde_json::to_vec(entry.value()).map_or(0, |v| v.len() as u64);
    let tag_size: u64 = entry.tags().iter().map(|t| 24 + t.len() as u64).sum();
    ENTRY_OVERHEAD + key.len() as u64 + payload + tag_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_config(max_entries: usize) -> MemoryConfig {
        MemoryConfig {
            max_entries,
            max_bytes: u64::MAX,
            ..MemoryConfig::default()
        }
    }

    fn entry(value: serde_json::Value, ttl: Duration) -> CacheEntry {
        CacheEntry::new(value, ttl, None, vec![])
    }

    #[test]
    fn set_then_get_round_trips() {
        let layer = MemoryLayer::new(MemoryConfig::default());
        layer.set("k".into(), entry(json!({"id": 1}), Duration::from_secs(60)));
        let got = layer.get("k").expect("hit");
        assert_eq!(got.value(), &json!({"id": 1}));
        assert_eq!(got.access_count(), 1);
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let layer = MemoryLayer::new(MemoryConfig::default());
        layer.set("k".into(), entry(json!(1), Duration::ZERO));
        assert!(layer.get("k").is_none());
        assert_eq!(layer.stats().expired_evictions, 1);
        assert!(layer.is_empty());
    }

    #[test]
    fn count_bound_triggers_lru_eviction() {
        // GIVEN: a 3-entry cap with distinguishable access times
        let layer = MemoryLayer::new(small_config(3));
        layer.set("a".into(), entry(json!(1), Duration::from_secs(60)));
        layer.set("b".into(), entry(json!(2), Duration::from_secs(60)));
        layer.set("c".into(), entry(json!(3), Duration::from_secs(60)));

        // Touch a and c so b is the least recently used
        std::thread::sleep(Duration::from_millis(5));
        let _ = layer.get("a");
        let _ = layer.get("c");

        // WHEN: a fourth entry arrives
        layer.set("d".into(), entry(json!(4), Duration::from_secs(60)));

        // THEN: the least recently accessed entry was evicted
        assert!(layer.len() <= 3);
        assert!(layer.get("b").is_none());
        assert!(layer.get("a").is_some());
        assert_eq!(layer.stats().evictions, 1);
    }

    #[test]
    fn expired_entries_are_evicted_before_live_ones() {
        let layer = MemoryLayer::new(small_config(2));
        layer.set("dead".into(), entry(json!(0), Duration::ZERO));
        layer.set("live".into(), entry(json!(1), Duration::from_secs(60)));
        layer.set("more".into(), entry(json!(2), Duration::from_secs(60)));

        assert!(layer.get("live").is_some());
        assert!(layer.get("more").is_some());
    }

    #[test]
    fn byte_bound_triggers_eviction() {
        let config = MemoryConfig {
            max_entries: usize::MAX,
            max_bytes: 400,
            ..MemoryConfig::default()
        };
        let layer = MemoryLayer::new(config);
        for i in 0..10 {
            layer.set(
                format!("key-{i}"),
                entry(json!("x".repeat(100)), Duration::from_secs(60)),
            );
        }
        assert!(layer.stats().bytes <= 400, "bytes: {}", layer.stats().bytes);
        assert!(layer.stats().evictions > 0);
    }

    #[test]
    fn remove_by_tag_removes_exactly_tagged_entries() {
        let layer = MemoryLayer::new(MemoryConfig::default());
        layer.set(
            "u1".into(),
            CacheEntry::new(json!(1), Duration::from_secs(60), None, vec!["users".into()]),
        );
        layer.set(
            "o1".into(),
            CacheEntry::new(json!(2), Duration::from_secs(60), None, vec!["orders".into()]),
        );

        let removed = layer.remove_by_tag("users");
        assert_eq!(removed, vec!["u1"]);
        assert!(layer.get("u1").is_none());
        assert!(layer.get("o1").is_some());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let layer = MemoryLayer::new(MemoryConfig::default());
        layer.set("dead".into(), entry(json!(0), Duration::ZERO));
        layer.set("live".into(), entry(json!(1), Duration::from_secs(60)));

        layer.sweep();

        assert_eq!(layer.len(), 1);
        assert!(layer.get("live").is_some());
    }

    #[test]
    fn replacing_an_entry_keeps_byte_accounting_consistent() {
        let layer = MemoryLayer::new(MemoryConfig::default());
        layer.set("k".into(), entry(json!("x".repeat(1000)), Duration::from_secs(60)));
        let big = layer.stats().bytes;
        layer.set("k".into(), entry(json!("x"), Duration::from_secs(60)));
        assert!(layer.stats().bytes < big);
        layer.remove("k");
        assert_eq!(layer.stats().bytes, 0);
    }

    #[test]
    fn disabled_estimator_reports_zero() {
        let config = MemoryConfig {
            estimator: EstimatorMode::Disabled,
            ..MemoryConfig::default()
        };
        let layer = MemoryLayer::new(config);
        layer.set("k".into(), entry(json!("payload"), Duration::from_secs(60)));
        assert_eq!(layer.stats().bytes, 0);
    }

    #[test]
    fn accurate_estimator_measures_on_throttle() {
        let config = MemoryConfig {
            estimator: EstimatorMode::Accurate,
            estimator_every: 1,
            ..MemoryConfig::default()
        };
        let layer = MemoryLayer::new(config);
        layer.set("k".into(), entry(json!("x".repeat(500)), Duration::from_secs(60)));
        // Serialized length dominates the estimate
        assert!(layer.stats().bytes > 500);
    }

    #[tokio::test]
    async fn spawn_sweep_evicts_in_background() {
        let config = MemoryConfig {
            sweep_interval: Duration::from_millis(10),
            ..MemoryConfig::default()
        };
        let layer = Arc::new(MemoryLayer::new(config));
        layer.set("dead".into(), entry(json!(0), Duration::ZERO));

        MemoryLayer::spawn_sweep(Arc::clone(&layer));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(layer.is_empty());
    }
}
