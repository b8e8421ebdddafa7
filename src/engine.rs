//! The cache engine: one value owning every component
//!
//! There is no ambient state in this crate: a process instantiates one (or
//! more) [`MethodCacheEngine`]s, each owning its memory layer, tag index,
//! write queue, policy pipeline, optional lower layers, and optional
//! backplane subscription. Construction goes through [`EngineBuilder`];
//! shutdown releases resources in reverse priority order, draining or
//! dropping queued writes per configuration.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::backplane::{
    BackplanePublisher, BackplaneSubscriber, BackplaneTransport, SubscriptionState,
};
use crate::config::EngineConfig;
use crate::coordinator::{LowerLayer, StorageCoordinator};
use crate::layer::{CacheLayer, GuardedLayer, LayerHealth};
use crate::manager::{CacheManager, CallOptions};
use crate::memory::{MemoryLayer, MemoryStats};
use crate::policy::file::FilePolicySource;
use crate::policy::resolver::PolicyResolver;
use crate::policy::runtime::{PolicyOverride, RuntimeOverrides};
use crate::policy::source::PolicySource;
use crate::policy::CachePolicy;
use crate::queue::{QueueStats, WriteQueue};
use crate::stats::{CacheStats, StatsSnapshot};
use crate::tags::TagIndex;
use crate::Result;

/// Builder for [`MethodCacheEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    distributed: Option<Arc<dyn CacheLayer>>,
    persistent: Option<Arc<dyn CacheLayer>>,
    backplane: Option<Arc<dyn BackplaneTransport>>,
    sources: Vec<Arc<dyn PolicySource>>,
    file_source: Option<Arc<FilePolicySource>>,
    watch_policy_file: bool,
}

impl EngineBuilder {
    /// Start a builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            distributed: None,
            persistent: None,
            backplane: None,
            sources: Vec::new(),
            file_source: None,
            watch_policy_file: true,
        }
    }

    /// Use the given engine configuration
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a distributed (L2) layer
    #[must_use]
    pub fn with_distributed(mut self, layer: Arc<dyn CacheLayer>) -> Self {
        self.distributed = Some(layer);
        self
    }

    /// Attach a persistent (L3) layer
    #[must_use]
    pub fn with_persistent(mut self, layer: Arc<dyn CacheLayer>) -> Self {
        self.persistent = Some(layer);
        self
    }

    /// Attach a backplane transport
    #[must_use]
    pub fn with_backplane(mut self, transport: Arc<dyn BackplaneTransport>) -> Self {
        self.backplane = Some(transport);
        self
    }

    /// Register an additional policy source
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn PolicySource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Load a `MethodCache:` policy file and register it as a source.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed.
    pub fn with_policy_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.file_source = Some(Arc::new(FilePolicySource::load(path)?));
        Ok(self)
    }

    /// Disable the policy-file watcher (reloads become manual)
    #[must_use]
    pub fn without_file_watching(mut self) -> Self {
        self.watch_policy_file = false;
        self
    }

    /// Assemble and start the engine.
    ///
    /// Must be called from within a tokio runtime: the sweep task, queue
    /// workers, policy listeners, file watcher, and backplane subscription
    /// are all spawned here.
    pub fn build(self) -> Result<MethodCacheEngine> {
        let instance_id = Uuid::new_v4();
        let stats = Arc::new(CacheStats::new());

        let memory = Arc::new(MemoryLayer::new(self.config.memory.clone()));
        MemoryLayer::spawn_sweep(Arc::clone(&memory));

        let tags = Arc::new(TagIndex::new());

        let queue = Arc::new(WriteQueue::new(self.config.queue.clone()));
        queue.spawn_workers();

        let mut lower = Vec::new();
        if let Some(layer) = self.distributed {
            lower.push(LowerLayer {
                layer: Arc::new(GuardedLayer::new(
                    layer,
                    &self.config.breaker,
                    self.config.layers.read_timeout,
                    self.config.layers.write_timeout,
                )) as Arc<dyn CacheLayer>,
                ttl: self.config.layers.distributed.clone(),
            });
        }
        if let Some(layer) = self.persistent {
            lower.push(LowerLayer {
                layer: Arc::new(GuardedLayer::new(
                    layer,
                    &self.config.breaker,
                    self.config.layers.read_timeout,
                    self.config.layers.write_timeout,
                )) as Arc<dyn CacheLayer>,
                ttl: self.config.layers.persistent.clone(),
            });
        }

        let publisher = self
            .backplane
            .as_ref()
            .map(|transport| Arc::new(BackplanePublisher::new(Arc::clone(transport), instance_id)));

        let coordinator = Arc::new(StorageCoordinator::new(
            Arc::clone(&memory),
            lower,
            Arc::clone(&tags),
            Arc::clone(&queue),
            publisher,
            self.config.queue.write_through,
        ));

        let subscriber = self.backplane.map(|transport| {
            let remote_target = Arc::clone(&coordinator);
            BackplaneSubscriber::start(
                transport,
                instance_id,
                Arc::new(move |msg: &crate::backplane::BackplaneMessage| {
                    remote_target.apply_remote(msg);
                }),
                &self.config.backplane,
            )
        });

        let overrides = Arc::new(RuntimeOverrides::new());
        let resolver = Arc::new(PolicyResolver::new());
        resolver.add_source(Arc::clone(&overrides) as Arc<dyn PolicySource>);
        for source in self.sources {
            resolver.add_source(source);
        }
        if let Some(file_source) = &self.file_source {
            resolver.add_source(Arc::clone(file_source) as Arc<dyn PolicySource>);
            if self.watch_policy_file {
                file_source.start_watching()?;
            }
        }

        let manager = CacheManager::new(
            Arc::clone(&resolver),
            Arc::clone(&coordinator),
            self.config.stripes.count(),
            Arc::clone(&stats),
        );

        info!(%instance_id, "Cache engine started");
        Ok(MethodCacheEngine {
            instance_id,
            manager,
            resolver,
            overrides,
            memory,
            queue,
            subscriber,
            file_source: self.file_source,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running cache engine
pub struct MethodCacheEngine {
    instance_id: Uuid,
    manager: CacheManager,
    resolver: Arc<PolicyResolver>,
    overrides: Arc<RuntimeOverrides>,
    memory: Arc<MemoryLayer>,
    queue: Arc<WriteQueue>,
    subscriber: Option<BackplaneSubscriber>,
    file_source: Option<Arc<FilePolicySource>>,
}

impl MethodCacheEngine {
    /// Start building an engine
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Unique id of this engine instance, stamped on backplane messages
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The cache manager (call surface)
    #[must_use]
    pub fn cache(&self) -> &CacheManager {
        &self.manager
    }

    /// Resolve, probe, and on miss fill through `factory`
    pub async fn get_or_create<F, Fut>(
        &self,
        method_id: &str,
        args: &[Value],
        factory: F,
        options: CallOptions,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.manager
            .get_or_create(method_id, args, factory, options)
            .await
    }

    /// Probe without a factory
    pub async fn try_get(&self, method_id: &str, args: &[Value]) -> Option<Value> {
        self.manager.try_get(method_id, args).await
    }

    /// Remove specific cache keys from every layer
    pub async fn invalidate_keys(&self, keys: &[String]) {
        self.manager.invalidate_keys(keys).await;
    }

    /// Remove every entry carrying one of `tags`
    pub async fn invalidate_tags(&self, tags: &[String]) {
        self.manager.invalidate_tags(tags).await;
    }

    /// Remove every entry whose tag matches the glob `pattern`
    pub async fn invalidate_tag_pattern(&self, pattern: &str) {
        self.manager.invalidate_tag_pattern(pattern).await;
    }

    /// Clear every layer
    pub async fn clear(&self) {
        self.manager.clear().await;
    }

    // ── management surface ────────────────────────────────────────────────

    /// Apply runtime policy overrides (highest priority)
    pub fn apply_overrides(&self, overrides: Vec<PolicyOverride>) {
        self.overrides.apply_overrides(overrides);
    }

    /// Remove the runtime override for one method
    pub fn remove_override(&self, method_id: &str) -> bool {
        self.overrides.remove_override(method_id)
    }

    /// Drop every runtime override
    pub fn clear_overrides(&self) {
        self.overrides.clear_overrides();
    }

    /// Current runtime overrides
    #[must_use]
    pub fn get_overrides(&self) -> Vec<PolicyOverride> {
        self.overrides.get_overrides()
    }

    /// Effective merged policy for a method, without mutating resolver state
    #[must_use]
    pub fn get_effective(&self, method_id: &str) -> CachePolicy {
        self.resolver.effective(method_id)
    }

    // ── observability ─────────────────────────────────────────────────────

    /// Usage statistics snapshot
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.manager.stats().snapshot()
    }

    /// Memory-layer statistics
    #[must_use]
    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.stats()
    }

    /// Write-queue statistics
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Per-layer health reports
    pub async fn health(&self) -> Vec<(String, LayerHealth)> {
        self.manager.coordinator().health().await
    }

    /// Backplane subscription state; `Idle` when no backplane is attached
    #[must_use]
    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscriber
            .as_ref()
            .map_or(SubscriptionState::Idle, BackplaneSubscriber::state)
    }

    // ── lifecycle ─────────────────────────────────────────────────────────

    /// Shut the engine down: stop the backplane subscription, drain or drop
    /// queued writes (per configuration), and stop policy listeners. Layers
    /// are released in reverse priority order when the engine drops.
    pub async fn shutdown(&self) {
        if let Some(subscriber) = &self.subscriber {
            subscriber.unsubscribe().await;
        }
        self.queue.shutdown().await;
        if let Some(file_source) = &self.file_source {
            file_source.stop_watching();
        }
        self.resolver.shutdown();
        info!(instance_id = %self.instance_id, "Cache engine stopped");
    }
}
