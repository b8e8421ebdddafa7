//! Uniform layer contract for L2/L3 stores
//!
//! Every storage layer exposes the same async read/write/remove contract.
//! Concrete drivers (Redis, SQL, …) live outside this crate; here are the
//! trait, an in-memory store that stands in for an external layer in tests
//! and demos, and [`GuardedLayer`] which wraps any layer with a per-operation
//! timeout and a circuit breaker.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{trace, warn};

use crate::breaker::{BreakerStats, LayerBreaker};
use crate::config::BreakerConfig;
use crate::entry::CacheEntry;
use crate::memory::MemoryLayer;
use crate::{Error, Result};

/// Position of a layer in the storage hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// In-process memory (L1)
    Memory,
    /// Out-of-process, low-latency, possibly volatile (L2)
    Distributed,
    /// Out-of-process, durable (L3)
    Persistent,
}

impl LayerKind {
    /// Lowercase label for logs and health output
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Distributed => "distributed",
            Self::Persistent => "persistent",
        }
    }
}

/// Health report for one layer
#[derive(Debug, Clone)]
pub struct LayerHealth {
    /// Whether the layer is serving requests
    pub healthy: bool,
    /// Free-form detail
    pub detail: String,
    /// Breaker snapshot when the layer is guarded
    pub breaker: Option<BreakerStats>,
}

/// Uniform contract over cache storage layers
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Layer name for logs and error attribution
    fn name(&self) -> &str;

    /// Position in the hierarchy
    fn kind(&self) -> LayerKind;

    /// Read an entry; absent and expired both report `None`
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Write an entry with the TTL the coordinator clamped for this layer
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()>;

    /// Remove one key; returns whether it was present
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Remove every entry carrying `tag`; returns the removed keys
    async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>>;

    /// Drop every entry
    async fn clear(&self) -> Result<()>;

    /// Health report
    async fn health(&self) -> LayerHealth;
}

// ── L1 adapter ────────────────────────────────────────────────────────────

#[async_trait]
impl CacheLayer for MemoryLayer {
    fn name(&self) -> &str {
        "memory"
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(MemoryLayer::get(self, key).map(|arc| (*arc).clone()))
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()> {
        MemoryLayer::set(self, key.to_string(), entry.with_ttl(ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(MemoryLayer::remove(self, key))
    }

    async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        Ok(MemoryLayer::remove_by_tag(self, tag))
    }

    async fn clear(&self) -> Result<()> {
        MemoryLayer::clear(self);
        Ok(())
    }

    async fn health(&self) -> LayerHealth {
        LayerHealth {
            healthy: true,
            detail: format!("{} entries", self.len()),
            breaker: None,
        }
    }
}

// ── In-memory stand-in for an external store ──────────────────────────────

/// In-memory implementation of the layer contract.
///
/// Stands in for an external L2/L3 driver in tests and demos. Failures can
/// be injected to exercise breaker and retry paths, and an artificial
/// latency simulates a slow store.
pub struct InMemoryStore {
    name: String,
    kind: LayerKind,
    entries: DashMap<String, CacheEntry>,
    failing: AtomicBool,
    fail_next: AtomicU32,
    latency: Option<Duration>,
}

impl InMemoryStore {
    /// Create a store presenting as the given layer kind
    #[must_use]
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            entries: DashMap::new(),
            failing: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            latency: None,
        }
    }

    /// Add an artificial delay to every operation
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Toggle persistent failure injection
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Fail the next `count` operations, then recover
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::Relaxed);
    }

    /// Number of stored entries (expired included until read)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn simulate(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::transient(&self.name, "injected failure"));
        }
        let remaining = self.fail_next.load(Ordering::Relaxed);
        if remaining > 0
            && self
                .fail_next
                .compare_exchange(remaining, remaining - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Err(Error::transient(&self.name, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheLayer for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        self.kind
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.simulate().await?;
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value().clone()))
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()> {
        self.simulate().await?;
        self.entries.insert(key.to_string(), entry.with_ttl(ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.simulate().await?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        self.simulate().await?;
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().tags().iter().any(|t| t == tag))
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        self.simulate().await?;
        self.entries.clear();
        Ok(())
    }

    async fn health(&self) -> LayerHealth {
        LayerHealth {
            healthy: !self.failing.load(Ordering::Relaxed),
            detail: format!("{} entries", self.entries.len()),
            breaker: None,
        }
    }
}

// ── Namespace prefixing ───────────────────────────────────────────────────

/// Prefixes every key written to an external store with a configurable
/// namespace and optional schema identifier, so multiple applications (or
/// incompatible schema generations) can share one L2/L3 store.
pub struct NamespacedLayer {
    inner: Arc<dyn CacheLayer>,
    prefix: String,
}

impl NamespacedLayer {
    /// Wrap `inner`, prefixing keys with `{namespace}:` (plus `{schema}:`
    /// when given)
    #[must_use]
    pub fn new(inner: Arc<dyn CacheLayer>, namespace: &str, schema: Option<&str>) -> Self {
        let prefix = match schema {
            Some(schema) => format!("{namespace}:{schema}:"),
            None => format!("{namespace}:"),
        };
        Self { inner, prefix }
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn strip(&self, key: &str) -> String {
        key.strip_prefix(&self.prefix).unwrap_or(key).to_string()
    }
}

#[async_trait]
impl CacheLayer for NamespacedLayer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> LayerKind {
        self.inner.kind()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.inner.get(&self.prefixed(key)).await
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()> {
        self.inner.set(&self.prefixed(key), entry, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.inner.remove(&self.prefixed(key)).await
    }

    async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let keys = self.inner.remove_by_tag(tag).await?;
        Ok(keys.iter().map(|k| self.strip(k)).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn health(&self) -> LayerHealth {
        self.inner.health().await
    }
}

// ── Guarded layer: timeout + breaker ──────────────────────────────────────

/// Wraps a layer with per-operation timeouts and a circuit breaker.
///
/// Open breaker: reads report "not present" and writes are skipped, so a
/// dead store degrades to misses instead of latency. Read timeouts also
/// report "not present"; write timeouts surface as transient errors so the
/// async write queue can retry or drop.
pub struct GuardedLayer {
    inner: Arc<dyn CacheLayer>,
    breaker: LayerBreaker,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl GuardedLayer {
    /// Guard `inner` with the given breaker configuration and timeouts
    #[must_use]
    pub fn new(
        inner: Arc<dyn CacheLayer>,
        breaker_config: &BreakerConfig,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        let breaker = LayerBreaker::new(inner.name(), breaker_config);
        Self {
            inner,
            breaker,
            read_timeout,
            write_timeout,
        }
    }

    /// Breaker snapshot
    #[must_use]
    pub fn breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    fn transient(&self, what: &str) -> Error {
        Error::transient(self.inner.name(), what)
    }
}

#[async_trait]
impl CacheLayer for GuardedLayer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> LayerKind {
        self.inner.kind()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        if !self.breaker.can_proceed() {
            trace!(layer = self.inner.name(), "Breaker open, read degrades to miss");
            return Ok(None);
        }
        match tokio::time::timeout(self.read_timeout, self.inner.get(key)).await {
            Ok(Ok(found)) => {
                self.breaker.record_success();
                Ok(found)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure();
                warn!(layer = self.inner.name(), key, "Layer read timed out");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()> {
        if !self.breaker.can_proceed() {
            trace!(layer = self.inner.name(), "Breaker open, write skipped");
            return Ok(());
        }
        match tokio::time::timeout(self.write_timeout, self.inner.set(key, entry, ttl)).await {
            Ok(Ok(())) => {
                self.breaker.record_success();
                Ok(())
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(self.transient("write timed out"))
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        if !self.breaker.can_proceed() {
            return Ok(false);
        }
        match tokio::time::timeout(self.write_timeout, self.inner.remove(key)).await {
            Ok(Ok(removed)) => {
                self.breaker.record_success();
                Ok(removed)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(self.transient("remove timed out"))
            }
        }
    }

    async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        if !self.breaker.can_proceed() {
            return Ok(Vec::new());
        }
        match tokio::time::timeout(self.write_timeout, self.inner.remove_by_tag(tag)).await {
            Ok(Ok(keys)) => {
                self.breaker.record_success();
                Ok(keys)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(self.transient("remove_by_tag timed out"))
            }
        }
    }

    async fn clear(&self) -> Result<()> {
        if !self.breaker.can_proceed() {
            return Ok(());
        }
        match tokio::time::timeout(self.write_timeout, self.inner.clear()).await {
            Ok(Ok(())) => {
                self.breaker.record_success();
                Ok(())
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(self.transient("clear timed out"))
            }
        }
    }

    async fn health(&self) -> LayerHealth {
        let mut health = self.inner.health().await;
        let stats = self.breaker.stats();
        if stats.state != crate::breaker::BreakerState::Closed {
            health.healthy = false;
        }
        health.breaker = Some(stats);
        health
    }
}
