//! Usage statistics for the cache engine
//!
//! Tracks hit/miss/error counters and factory latency samples, globally and
//! per method identity. All counters are atomics; `snapshot()` produces a
//! serializable view with derived rates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Default)]
struct MethodCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    latency_us_sum: AtomicU64,
    latency_samples: AtomicU64,
}

/// Engine-wide usage statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    factory_executions: AtomicU64,
    per_method: DashMap<String, MethodCounters>,
}

impl CacheStats {
    /// Create a zeroed statistics tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cache hit for `method`
    pub fn record_hit(&self, method: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.method(method).hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache miss for `method`
    pub fn record_miss(&self, method: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.method(method).misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a caller-visible error for `method`
    pub fn record_error(&self, method: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.method(method).errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one factory execution and its latency
    pub fn record_factory(&self, method: &str, latency: Duration) {
        self.factory_executions.fetch_add(1, Ordering::Relaxed);
        let counters = self.method(method);
        #[allow(clippy::cast_possible_truncation)]
        let micros = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        counters.latency_us_sum.fetch_add(micros, Ordering::Relaxed);
        counters.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Total hits
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total misses
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Total caller-visible errors
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Total factory executions
    #[must_use]
    pub fn factory_executions(&self) -> u64 {
        self.factory_executions.load(Ordering::Relaxed)
    }

    /// Average factory latency observed for `method`
    #[must_use]
    pub fn avg_factory_latency(&self, method: &str) -> Option<Duration> {
        let counters = self.per_method.get(method)?;
        let samples = counters.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return None;
        }
        let sum = counters.latency_us_sum.load(Ordering::Relaxed);
        Some(Duration::from_micros(sum / samples))
    }

    /// Serializable snapshot with the ten busiest methods
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let hits = self.hits();
        let misses = self.misses();
        let total = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        let mut methods: Vec<MethodUsage> = self
            .per_method
            .iter()
            .map(|entry| {
                let c = entry.value();
                let samples = c.latency_samples.load(Ordering::Relaxed);
                let avg_latency_us = if samples == 0 {
                    0
                } else {
                    c.latency_us_sum.load(Ordering::Relaxed) / samples
                };
                MethodUsage {
                    method: entry.key().clone(),
                    hits: c.hits.load(Ordering::Relaxed),
                    misses: c.misses.load(Ordering::Relaxed),
                    errors: c.errors.load(Ordering::Relaxed),
                    avg_latency_us,
                }
            })
            .collect();
        methods.sort_by(|a, b| (b.hits + b.misses).cmp(&(a.hits + a.misses)));
        methods.truncate(10);

        StatsSnapshot {
            hits,
            misses,
            errors: self.errors(),
            factory_executions: self.factory_executions(),
            hit_rate,
            top_methods: methods,
        }
    }

    fn method(&self, method: &str) -> dashmap::mapref::one::Ref<'_, String, MethodCounters> {
        if let Some(existing) = self.per_method.get(method) {
            return existing;
        }
        self.per_method
            .entry(method.to_string())
            .or_default()
            .downgrade()
    }
}

/// Point-in-time statistics view
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total caller-visible errors
    pub errors: u64,
    /// Total factory executions
    pub factory_executions: u64,
    /// Hit rate (0.0–1.0)
    pub hit_rate: f64,
    /// Ten busiest methods by traffic
    pub top_methods: Vec<MethodUsage>,
}

/// Per-method usage line in a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MethodUsage {
    /// Method identity
    pub method: String,
    /// Hits for this method
    pub hits: u64,
    /// Misses for this method
    pub misses: u64,
    /// Errors for this method
    pub errors: u64,
    /// Average factory latency in microseconds
    pub avg_latency_us: u64,
}
