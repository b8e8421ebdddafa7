//! Cache manager: the public request-resolution surface
//!
//! `get_or_create` resolves the method's policy, derives the cache key,
//! probes the layered storage, and on a miss invokes the caller's factory
//! under the configured stampede protection. Only three errors ever reach a
//! caller: [`Error::NotIdempotent`], [`Error::Factory`], and
//! [`Error::Cancelled`]; everything else is absorbed as a miss.
//!
//! Stampede modes:
//!
//! - **strict single-flight**: one factory execution per miss; concurrent
//!   callers share the outcome.
//! - **probabilistic early refresh**: a hit near expiry triggers, with a
//!   probability that grows as the deadline approaches (scaled by the
//!   method's observed factory latency and the policy's `beta`), one
//!   background refresh under single-flight while readers keep serving the
//!   current entry.
//! - **refresh-ahead**: like the above but deterministic: any hit with
//!   remaining TTL below the configured window schedules the refresh.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::coordinator::StorageCoordinator;
use crate::entry::CacheEntry;
use crate::flight::SingleFlight;
use crate::key;
use crate::policy::resolver::PolicyResolver;
use crate::policy::{apply_override, CachePolicy, CallSite, PolicyFragment, StampedeMode};
use crate::stats::CacheStats;
use crate::{Error, Result};

/// Fallback factory-cost estimate for the probabilistic refresh trigger,
/// used until real latency samples exist
const DEFAULT_FACTORY_COST: Duration = Duration::from_millis(100);

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Caller asserts the method is idempotent and safe to cache
    pub idempotent: bool,
    /// Cancellation signal for this caller
    pub cancel: CancellationToken,
    /// Highest-priority per-call policy overlay
    pub policy_override: Option<PolicyFragment>,
}

impl CallOptions {
    /// Options asserting idempotency
    #[must_use]
    pub fn idempotent() -> Self {
        Self {
            idempotent: true,
            ..Self::default()
        }
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach a per-call policy overlay
    #[must_use]
    pub fn with_override(mut self, fragment: PolicyFragment) -> Self {
        self.policy_override = Some(fragment);
        self
    }
}

/// Public façade over policy resolution, key derivation, layered storage,
/// and stampede protection
pub struct CacheManager {
    resolver: Arc<PolicyResolver>,
    coordinator: Arc<StorageCoordinator>,
    flight: SingleFlight,
    stats: Arc<CacheStats>,
}

impl CacheManager {
    /// Compose the manager
    #[must_use]
    pub fn new(
        resolver: Arc<PolicyResolver>,
        coordinator: Arc<StorageCoordinator>,
        stripes: usize,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            resolver,
            coordinator,
            flight: SingleFlight::new(stripes),
            stats,
        }
    }

    /// Usage statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// The storage coordinator
    #[must_use]
    pub fn coordinator(&self) -> &Arc<StorageCoordinator> {
        &self.coordinator
    }

    /// Resolve, probe, and on miss fill through `factory`.
    ///
    /// # Errors
    ///
    /// [`Error::NotIdempotent`] when the resolved policy requires an
    /// idempotency assertion the call site did not make; [`Error::Factory`]
    /// when the factory fails (shared by every single-flight waiter, never
    /// cached); [`Error::Cancelled`] when `options.cancel` fires first.
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
        let mut policy = self.resolver.resolve(method_id);
        if let Some(fragment) = &options.policy_override {
            policy = apply_override(&policy, fragment);
        }

        if policy.require_idempotent && !options.idempotent {
            self.stats.record_error(method_id);
            return Err(Error::NotIdempotent(method_id.to_string()));
        }

        let site = CallSite { method_id, args };
        if !policy.enabled || !policy.predicates.evaluate(&site) {
            // Caching is gated off for this call; the factory runs bare
            return self
                .run_factory_uncached(method_id, factory, &options.cancel)
                .await;
        }

        let cache_key = key::generate(method_id, args, &policy);

        if let Some(entry) = self.coordinator.read(&cache_key).await {
            self.stats.record_hit(method_id);
            if self.should_refresh(&entry, &policy, method_id) {
                self.spawn_refresh(method_id, &cache_key, &policy, factory);
            }
            return Ok(entry.value().clone());
        }
        self.stats.record_miss(method_id);

        match policy.stampede {
            StampedeMode::None => {
                let value = self
                    .run_factory_uncached(method_id, factory, &options.cancel)
                    .await?;
                self.coordinator.write(&cache_key, value.clone(), &policy).await;
                Ok(value)
            }
            StampedeMode::SingleFlight | StampedeMode::Probabilistic { .. } => {
                let work = self.fill_work(method_id, &cache_key, &policy, factory, true);
                self.flight.execute(&cache_key, &options.cancel, work).await
            }
        }
    }

    /// Typed convenience over [`CacheManager::get_or_create`]
    pub async fn get_or_create_typed<T, F, Fut>(
        &self,
        method_id: &str,
        args: &[Value],
        factory: F,
        options: CallOptions,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let method = method_id.to_string();
        let value = self
            .get_or_create(
                method_id,
                args,
                move || async move {
                    let value = factory().await?;
                    serde_json::to_value(value).map_err(anyhow::Error::from)
                },
                options,
            )
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Factory {
            method,
            message: format!("cached value has unexpected shape: {e}"),
        })
    }

    /// Probe without a factory; only hit/miss counters are touched
    pub async fn try_get(&self, method_id: &str, args: &[Value]) -> Option<Value> {
        let policy = self.resolver.resolve(method_id);
        let cache_key = key::generate(method_id, args, &policy);
        match self.coordinator.read(&cache_key).await {
            Some(entry) => {
                self.stats.record_hit(method_id);
                Some(entry.value().clone())
            }
            None => {
                self.stats.record_miss(method_id);
                None
            }
        }
    }

    /// Remove specific cache keys from every layer
    pub async fn invalidate_keys(&self, keys: &[String]) {
        self.coordinator.invalidate_keys(keys).await;
    }

    /// Remove every entry carrying one of `tags`
    pub async fn invalidate_tags(&self, tags: &[String]) {
        let _ = self.coordinator.invalidate_tags(tags).await;
    }

    /// Remove every entry whose tag matches the glob `pattern`
    pub async fn invalidate_tag_pattern(&self, pattern: &str) {
        let _ = self.coordinator.invalidate_tag_pattern(pattern).await;
    }

    /// Clear every layer
    pub async fn clear(&self) {
        self.coordinator.clear().await;
    }

    // ── internals ─────────────────────────────────────────────────────────

    /// Build the single-flight work closure: optional re-probe, factory,
    /// store, return.
    fn fill_work<F, Fut>(
        &self,
        method_id: &str,
        cache_key: &str,
        policy: &CachePolicy,
        factory: F,
        reprobe: bool,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<Value>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let coordinator = Arc::clone(&self.coordinator);
        let stats = Arc::clone(&self.stats);
        let method = method_id.to_string();
        let cache_key = cache_key.to_string();
        let policy = policy.clone();

        move || {
            Box::pin(async move {
                if reprobe {
                    // A just-finished flight may already have filled the key
                    if let Some(entry) = coordinator.read(&cache_key).await {
                        return Ok(entry.value().clone());
                    }
                }
                let started = Instant::now();
                match factory().await {
                    Ok(value) => {
                        stats.record_factory(&method, started.elapsed());
                        coordinator.write(&cache_key, value.clone(), &policy).await;
                        Ok(value)
                    }
                    Err(e) => {
                        stats.record_error(&method);
                        Err(Error::factory(&method, &e))
                    }
                }
            })
        }
    }

    /// Run the factory without caching (policy disabled or predicate gated)
    async fn run_factory_uncached<F, Fut>(
        &self,
        method_id: &str,
        factory: F,
        cancel: &CancellationToken,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let started = Instant::now();
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = factory() => match result {
                Ok(value) => {
                    self.stats.record_factory(method_id, started.elapsed());
                    Ok(value)
                }
                Err(e) => {
                    self.stats.record_error(method_id);
                    Err(Error::factory(method_id, &e))
                }
            },
        }
    }

    /// Whether a hit should schedule a background refresh
    fn should_refresh(&self, entry: &CacheEntry, policy: &CachePolicy, method_id: &str) -> bool {
        let remaining = entry.remaining_ttl();
        if let Some(window) = policy.refresh_ahead {
            if remaining < window {
                return true;
            }
        }
        if let StampedeMode::Probabilistic { beta } = policy.stampede {
            // XFetch: refresh when remaining < cost * beta * -ln(U). The
            // expected trigger point scales with how long the factory takes.
            let cost = self
                .stats
                .avg_factory_latency(method_id)
                .unwrap_or(DEFAULT_FACTORY_COST);
            let uniform: f64 = fastrand::f64().max(f64::MIN_POSITIVE);
            let trigger = cost.as_secs_f64() * beta * -uniform.ln();
            return remaining.as_secs_f64() < trigger;
        }
        false
    }

    /// Schedule a detached refresh under single-flight; readers keep
    /// serving the current entry meanwhile.
    fn spawn_refresh<F, Fut>(
        &self,
        method_id: &str,
        cache_key: &str,
        policy: &CachePolicy,
        factory: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        // No re-probe: the point is to replace a still-live entry
        let work = self.fill_work(method_id, cache_key, policy, factory, false);
        let flight = self.flight.clone();
        let cache_key = cache_key.to_string();
        let method = method_id.to_string();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            if let Err(e) = flight.execute(&cache_key, &cancel, work).await {
                debug!(method = %method, error = %e, "Background refresh failed");
            }
        });
    }
}
