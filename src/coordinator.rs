//! Storage coordinator: layered read/write/invalidate protocol
//!
//! Composes the memory layer (L1) with a priority-ordered list of lower
//! layers. Reads probe in priority order and promote lower-layer hits back
//! into L1 with a clamped TTL; writes fill L1 synchronously and fan out to
//! lower layers through the async write queue (or synchronously when
//! write-through is configured); invalidations remove from every layer,
//! update the tag index, and publish on the backplane.
//!
//! Reads never fail because of layer errors (a failing layer reads as a
//! miss) and invalidations never fail because of backplane errors (they
//! succeed locally and the publish failure is logged).
//!
//! A short-lived tombstone per invalidated key resolves the race between a
//! promotion and a concurrent invalidation in the invalidation's favor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backplane::BackplanePublisher;
use crate::config::LayerTtlConfig;
use crate::entry::{CacheEntry, epoch_millis_now};
use crate::layer::{CacheLayer, LayerHealth};
use crate::memory::MemoryLayer;
use crate::policy::CachePolicy;
use crate::queue::{WriteQueue, WriteTask};
use crate::tags::TagIndex;

/// How long an invalidation tombstone suppresses promotions
const TOMBSTONE_TTL_MS: u64 = 2_000;

/// One lower layer with its TTL clamp
pub struct LowerLayer {
    /// The guarded layer
    pub layer: Arc<dyn CacheLayer>,
    /// TTL clamp applied to writes into this layer
    pub ttl: LayerTtlConfig,
}

/// Composes layers in priority order and enforces the storage protocol
pub struct StorageCoordinator {
    l1: Arc<MemoryLayer>,
    lower: Vec<LowerLayer>,
    tags: Arc<TagIndex>,
    queue: Arc<WriteQueue>,
    publisher: Option<Arc<BackplanePublisher>>,
    write_through: bool,
    /// Recently invalidated keys; promotions observing a tombstone re-remove
    tombstones: DashMap<String, u64>,
}

impl StorageCoordinator {
    /// Compose the coordinator
    #[must_use]
    pub fn new(
        l1: Arc<MemoryLayer>,
        lower: Vec<LowerLayer>,
        tags: Arc<TagIndex>,
        queue: Arc<WriteQueue>,
        publisher: Option<Arc<BackplanePublisher>>,
        write_through: bool,
    ) -> Self {
        Self {
            l1,
            lower,
            tags,
            queue,
            publisher,
            write_through,
            tombstones: DashMap::new(),
        }
    }

    /// The memory layer
    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryLayer> {
        &self.l1
    }

    /// The tag index
    #[must_use]
    pub fn tag_index(&self) -> &Arc<TagIndex> {
        &self.tags
    }

    // ── read protocol ─────────────────────────────────────────────────────

    /// Probe layers in priority order; the first hit wins.
    ///
    /// A hit below L1 is promoted into L1 with
    /// `min(remaining TTL, L1 max TTL)` so the hot path converges to memory.
    pub async fn read(&self, key: &str) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.l1.get(key) {
            return Some(entry);
        }

        for lower in &self.lower {
            match lower.layer.get(key).await {
                Ok(Some(entry)) => {
                    if entry.is_expired() {
                        continue;
                    }
                    self.promote(key, &entry);
                    return Some(Arc::new(entry));
                }
                Ok(None) => {}
                Err(e) => {
                    // Layer trouble must not fail the read; fall through
                    warn!(layer = lower.layer.name(), key, error = %e, "Layer read failed, treating as miss");
                }
            }
        }
        None
    }

    /// Write a promoted entry into L1 unless an invalidation won the race
    fn promote(&self, key: &str, entry: &CacheEntry) {
        if self.is_tombstoned(key) {
            debug!(key, "Skipped promotion of invalidated key");
            return;
        }
        let ttl = entry.remaining_ttl().min(self.l1.max_ttl());
        self.l1.set(key.to_string(), entry.clone().with_ttl(ttl));
        self.tags.associate(key, entry.tags());

        // Re-check: an invalidation that raced the set above must win
        if self.is_tombstoned(key) {
            self.l1.remove(key);
            self.tags.dissociate(key);
        }
    }

    // ── write protocol ────────────────────────────────────────────────────

    /// Fill all layers with a fresh value under `policy`.
    ///
    /// L1 is written synchronously; lower layers go through the async queue
    /// unless write-through is configured.
    pub async fn write(&self, key: &str, value: Value, policy: &CachePolicy) {
        // A fresh fill supersedes any pending tombstone for the key
        self.tombstones.remove(key);

        let entry = CacheEntry::new(
            value,
            policy.duration,
            policy.sliding,
            policy.tags.clone(),
        );

        let l1_ttl = policy.duration.min(self.l1.max_ttl());
        self.l1.set(key.to_string(), entry.clone().with_ttl(l1_ttl));
        self.tags.associate(key, &policy.tags);

        for lower in &self.lower {
            let ttl = clamp_lower_ttl(policy.duration, &lower.ttl);
            if self.write_through {
                if let Err(e) = lower.layer.set(key, entry.clone(), ttl).await {
                    warn!(layer = lower.layer.name(), key, error = %e, "Write-through to lower layer failed");
                }
            } else {
                self.queue.enqueue(WriteTask {
                    layer: Arc::clone(&lower.layer),
                    key: key.to_string(),
                    entry: entry.clone(),
                    ttl,
                    attempts: 0,
                });
            }
        }
    }

    // ── invalidate protocol ───────────────────────────────────────────────

    /// Remove keys from every layer, update the tag index, publish
    pub async fn invalidate_keys(&self, keys: &[String]) {
        for key in keys {
            self.tombstone(key);
            self.l1.remove(key);
            self.tags.dissociate(key);
            for lower in &self.lower {
                if let Err(e) = lower.layer.remove(key).await {
                    warn!(layer = lower.layer.name(), key = %key, error = %e, "Lower-layer remove failed");
                }
            }
            if let Some(publisher) = &self.publisher {
                publisher.publish_key(key).await;
            }
        }
    }

    /// Remove every entry carrying one of `tags` from every layer.
    ///
    /// Returns the locally-known keys that were invalidated.
    pub async fn invalidate_tags(&self, tags: &[String]) -> Vec<String> {
        let mut all_keys = Vec::new();
        for tag in tags {
            let keys = self.tags.remove_by_tag(tag);
            for key in &keys {
                self.tombstone(key);
                self.l1.remove(key);
                self.tags.dissociate(key);
            }
            for lower in &self.lower {
                if let Err(e) = lower.layer.remove_by_tag(tag).await {
                    warn!(layer = lower.layer.name(), tag = %tag, error = %e, "Lower-layer tag removal failed");
                }
            }
            if let Some(publisher) = &self.publisher {
                publisher.publish_tag(tag).await;
            }
            all_keys.extend(keys);
        }
        all_keys
    }

    /// Remove every entry whose tag matches the glob `pattern`.
    ///
    /// Returns `(matched tags, locally-known invalidated keys)`.
    pub async fn invalidate_tag_pattern(&self, pattern: &str) -> (Vec<String>, Vec<String>) {
        let (matched, keys) = self.tags.remove_by_tag_pattern(pattern);
        for key in &keys {
            self.tombstone(key);
            self.l1.remove(key);
            self.tags.dissociate(key);
        }
        for tag in &matched {
            for lower in &self.lower {
                if let Err(e) = lower.layer.remove_by_tag(tag).await {
                    warn!(layer = lower.layer.name(), tag = %tag, error = %e, "Lower-layer tag removal failed");
                }
            }
            if let Some(publisher) = &self.publisher {
                publisher.publish_tag(tag).await;
            }
        }
        (matched, keys)
    }

    /// Clear every layer and publish a clear-all
    pub async fn clear(&self) {
        self.l1.clear();
        self.tags.clear();
        for lower in &self.lower {
            if let Err(e) = lower.layer.clear().await {
                warn!(layer = lower.layer.name(), error = %e, "Lower-layer clear failed");
            }
        }
        if let Some(publisher) = &self.publisher {
            publisher.publish_clear().await;
        }
    }

    // ── backplane receive path ────────────────────────────────────────────

    /// Apply a foreign invalidation locally (L1 and tag index only; the
    /// emitting instance already handled the shared lower layers). Never
    /// re-publishes.
    pub fn apply_remote(&self, msg: &crate::backplane::BackplaneMessage) {
        match msg {
            crate::backplane::BackplaneMessage::Key { key, .. } => {
                self.tombstone(key);
                self.l1.remove(key);
                self.tags.dissociate(key);
            }
            crate::backplane::BackplaneMessage::Tag { tag, .. } => {
                let keys = self.tags.remove_by_tag(tag);
                for key in &keys {
                    self.tombstone(key);
                    self.l1.remove(key);
                    self.tags.dissociate(key);
                }
                // Entries that reached L1 without index bookkeeping
                for key in self.l1.remove_by_tag(tag) {
                    self.tombstone(&key);
                    self.tags.dissociate(&key);
                }
            }
            crate::backplane::BackplaneMessage::Clear { .. } => {
                self.l1.clear();
                self.tags.clear();
            }
        }
    }

    // ── health ────────────────────────────────────────────────────────────

    /// Health reports for every layer, priority order
    pub async fn health(&self) -> Vec<(String, LayerHealth)> {
        let mut reports = Vec::with_capacity(1 + self.lower.len());
        reports.push(("memory".to_string(), CacheLayer::health(&*self.l1).await));
        for lower in &self.lower {
            reports.push((lower.layer.name().to_string(), lower.layer.health().await));
        }
        reports
    }

    // ── tombstones ────────────────────────────────────────────────────────

    fn tombstone(&self, key: &str) {
        self.tombstones.insert(key.to_string(), epoch_millis_now());
        if self.tombstones.len() > 4096 {
            let now = epoch_millis_now();
            self.tombstones
                .retain(|_, stamped| now.saturating_sub(*stamped) < TOMBSTONE_TTL_MS);
        }
    }

    fn is_tombstoned(&self, key: &str) -> bool {
        match self.tombstones.get(key) {
            Some(stamped) => {
                if epoch_millis_now().saturating_sub(*stamped) < TOMBSTONE_TTL_MS {
                    true
                } else {
                    drop(stamped);
                    self.tombstones.remove(key);
                    false
                }
            }
            None => false,
        }
    }
}

/// Clamp a policy duration for a lower layer: the layer default substitutes
/// a zero duration; the layer maximum caps the result.
fn clamp_lower_ttl(duration: Duration, config: &LayerTtlConfig) -> Duration {
    let base = if duration.is_zero() {
        config.default.unwrap_or(duration)
    } else {
        duration
    };
    match config.max {
        Some(max) => base.min(max),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, QueueConfig};
    use crate::layer::{InMemoryStore, LayerKind};
    use serde_json::json;

    fn policy(duration: Duration, tags: Vec<String>) -> CachePolicy {
        CachePolicy {
            duration,
            tags,
            ..CachePolicy::default()
        }
    }

    struct Fixture {
        coordinator: StorageCoordinator,
        l2: Arc<InMemoryStore>,
        queue: Arc<WriteQueue>,
    }

    fn fixture(write_through: bool) -> Fixture {
        let l1 = Arc::new(MemoryLayer::new(MemoryConfig::default()));
        let l2 = Arc::new(InMemoryStore::new("l2", LayerKind::Distributed));
        let queue = Arc::new(WriteQueue::new(QueueConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..QueueConfig::default()
        }));
        let coordinator = StorageCoordinator::new(
            l1,
            vec![LowerLayer {
                layer: Arc::clone(&l2) as Arc<dyn CacheLayer>,
                ttl: LayerTtlConfig::default(),
            }],
            Arc::new(TagIndex::new()),
            Arc::clone(&queue),
            None,
            write_through,
        );
        Fixture {
            coordinator,
            l2,
            queue,
        }
    }

    #[tokio::test]
    async fn write_fills_l1_synchronously() {
        let f = fixture(false);
        f.coordinator
            .write("k", json!(1), &policy(Duration::from_secs(60), vec![]))
            .await;
        let entry = f.coordinator.read("k").await.expect("hit");
        assert_eq!(entry.value(), &json!(1));
    }

    #[tokio::test]
    async fn write_through_fills_lower_layers_inline() {
        let f = fixture(true);
        f.coordinator
            .write("k", json!(1), &policy(Duration::from_secs(60), vec![]))
            .await;
        assert!(f.l2.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn async_write_fans_out_through_the_queue() {
        let f = fixture(false);
        f.queue.spawn_workers();
        f.coordinator
            .write("k", json!(1), &policy(Duration::from_secs(60), vec![]))
            .await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while f.l2.get("k").await.unwrap().is_none() {
            assert!(tokio::time::Instant::now() < deadline, "queue never delivered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn lower_layer_hit_promotes_into_l1() {
        let f = fixture(false);
        // Seed only L2
        f.l2.set(
            "k",
            CacheEntry::new(json!("from-l2"), Duration::from_secs(60), None, vec![]),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let entry = f.coordinator.read("k").await.expect("l2 hit");
        assert_eq!(entry.value(), &json!("from-l2"));

        // Subsequent probe is served by L1 even with L2 failing
        f.l2.set_failing(true);
        let entry = f.coordinator.read("k").await.expect("l1 hit");
        assert_eq!(entry.value(), &json!("from-l2"));
    }

    #[tokio::test]
    async fn failing_lower_layer_reads_as_miss() {
        let f = fixture(false);
        f.l2.set_failing(true);
        assert!(f.coordinator.read("missing").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_keys_removes_from_all_layers() {
        let f = fixture(true);
        f.coordinator
            .write("k", json!(1), &policy(Duration::from_secs(60), vec![]))
            .await;

        f.coordinator.invalidate_keys(&["k".to_string()]).await;

        assert!(f.coordinator.read("k").await.is_none());
        assert!(f.l2.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let f = fixture(true);
        f.coordinator
            .write("k", json!(1), &policy(Duration::from_secs(60), vec![]))
            .await;
        f.coordinator.invalidate_keys(&["k".to_string()]).await;
        f.coordinator.invalidate_keys(&["k".to_string()]).await;
        assert!(f.coordinator.read("k").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_tags_covers_tagged_keys_everywhere() {
        let f = fixture(true);
        let users = policy(Duration::from_secs(60), vec!["users".to_string()]);
        f.coordinator.write("u:1", json!(1), &users).await;
        f.coordinator.write("u:2", json!(2), &users).await;
        f.coordinator
            .write(
                "o:1",
                json!(3),
                &policy(Duration::from_secs(60), vec!["orders".to_string()]),
            )
            .await;

        let mut removed = f.coordinator.invalidate_tags(&["users".to_string()]).await;
        removed.sort();
        assert_eq!(removed, vec!["u:1", "u:2"]);

        assert!(f.coordinator.read("u:1").await.is_none());
        assert!(f.coordinator.read("u:2").await.is_none());
        assert!(f.coordinator.read("o:1").await.is_some());
        assert!(f.l2.get("u:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pattern_invalidation_matches_glob() {
        let f = fixture(true);
        f.coordinator
            .write(
                "a",
                json!(1),
                &policy(Duration::from_secs(60), vec!["user:1".to_string()]),
            )
            .await;
        f.coordinator
            .write(
                "b",
                json!(2),
                &policy(Duration::from_secs(60), vec!["order:1".to_string()]),
            )
            .await;

        let (tags, keys) = f.coordinator.invalidate_tag_pattern("user:*").await;
        assert_eq!(tags, vec!["user:1"]);
        assert_eq!(keys, vec!["a"]);
        assert!(f.coordinator.read("a").await.is_none());
        assert!(f.coordinator.read("b").await.is_some());
    }

    #[tokio::test]
    async fn fresh_write_after_invalidation_is_served() {
        let f = fixture(true);
        let p = policy(Duration::from_secs(60), vec![]);
        f.coordinator.write("k", json!(1), &p).await;
        f.coordinator.invalidate_keys(&["k".to_string()]).await;
        f.coordinator.write("k", json!(2), &p).await;

        let entry = f.coordinator.read("k").await.expect("fresh fill");
        assert_eq!(entry.value(), &json!(2));
    }

    #[tokio::test]
    async fn promotion_loses_to_concurrent_invalidation() {
        let f = fixture(true);
        // Seed L2; the key is then invalidated (tombstoned)
        f.l2.set(
            "k",
            CacheEntry::new(json!(1), Duration::from_secs(60), None, vec![]),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        f.coordinator.invalidate_keys(&["k".to_string()]).await;

        // Re-seed L2 (e.g. another instance's async writer landing late)
        f.l2.set(
            "k",
            CacheEntry::new(json!(1), Duration::from_secs(60), None, vec![]),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        // A read that hits L2 must not resurrect the key in L1
        let found = f.coordinator.read("k").await;
        assert!(found.is_some(), "value is returned to the caller");
        assert!(
            f.coordinator.memory().get("k").is_none(),
            "tombstone suppresses promotion"
        );
    }

    #[tokio::test]
    async fn clear_empties_every_layer() {
        let f = fixture(true);
        f.coordinator
            .write(
                "k",
                json!(1),
                &policy(Duration::from_secs(60), vec!["t".to_string()]),
            )
            .await;
        f.coordinator.clear().await;

        assert!(f.coordinator.read("k").await.is_none());
        assert!(f.l2.is_empty());
        assert_eq!(f.coordinator.tag_index().tag_count(), 0);
    }

    #[tokio::test]
    async fn remote_tag_message_invalidates_locally() {
        let f = fixture(false);
        f.coordinator
            .write(
                "k",
                json!(1),
                &policy(Duration::from_secs(60), vec!["t".to_string()]),
            )
            .await;

        let msg = crate::backplane::BackplaneMessage::tag("t", uuid::Uuid::new_v4());
        f.coordinator.apply_remote(&msg);

        assert!(f.coordinator.memory().get("k").is_none());
    }

    #[test]
    fn lower_ttl_clamping_rules() {
        let unbounded = LayerTtlConfig::default();
        assert_eq!(
            clamp_lower_ttl(Duration::from_secs(60), &unbounded),
            Duration::from_secs(60)
        );

        let capped = LayerTtlConfig {
            max: Some(Duration::from_secs(30)),
            default: None,
        };
        assert_eq!(
            clamp_lower_ttl(Duration::from_secs(60), &capped),
            Duration::from_secs(30)
        );

        let defaulted = LayerTtlConfig {
            max: None,
            default: Some(Duration::from_secs(300)),
        };
        assert_eq!(
            clamp_lower_ttl(Duration::ZERO, &defaulted),
            Duration::from_secs(300)
        );
    }
}
