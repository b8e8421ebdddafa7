//! Policy resolution across prioritized sources
//!
//! The resolver owns the registered [`PolicySource`]s ordered by priority
//! descending, merges their fragments into effective [`CachePolicy`] values,
//! and caches the result per method identity. Source change events drop the
//! affected cached policies; a snapshot-replace event drops all of them.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::source::{PolicyEvent, PolicySource};
use super::{merge_fragments, CachePolicy, PolicyFragment};

/// Resolves effective policies by field-level merge over prioritized sources
pub struct PolicyResolver {
    /// Sources sorted by priority descending
    sources: RwLock<Vec<Arc<dyn PolicySource>>>,
    /// Cache of resolved policies
    resolved: DashMap<String, CachePolicy>,
    /// Stream of method identities whose policy changed
    changes: broadcast::Sender<String>,
    /// Listener task per source
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl PolicyResolver {
    /// Create a resolver with no sources
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            sources: RwLock::new(Vec::new()),
            resolved: DashMap::new(),
            changes,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a source and start forwarding its change events.
    ///
    /// Must be called from within a tokio runtime; a listener task per
    /// source translates source events into resolved-cache invalidations.
    pub fn add_source(self: &Arc<Self>, source: Arc<dyn PolicySource>) {
        let mut events = source.subscribe();
        {
            let mut sources = self.sources.write();
            sources.push(source);
            sources.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        }

        let resolver = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PolicyEvent::Changed(method_id)) => {
                        resolver.invalidate(&method_id);
                    }
                    Ok(PolicyEvent::SnapshotReplaced) => {
                        resolver.invalidate_all();
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed events: safest to drop everything resolved.
                        debug!(skipped, "Policy event stream lagged, dropping resolved cache");
                        resolver.invalidate_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.lock().push(handle);
    }

    /// Effective policy for a method identity, from cache when possible
    #[must_use]
    pub fn resolve(&self, method_id: &str) -> CachePolicy {
        if let Some(cached) = self.resolved.get(method_id) {
            return cached.clone();
        }
        let policy = self.merge_for(method_id);
        self.resolved.insert(method_id.to_string(), policy.clone());
        policy
    }

    /// Walk the merge pipeline without touching the resolved cache.
    ///
    /// Used by management queries that must observe the current effective
    /// view without side effects.
    #[must_use]
    pub fn effective(&self, method_id: &str) -> CachePolicy {
        self.merge_for(method_id)
    }

    /// Stream of method identities whose resolved policy was invalidated
    #[must_use]
    pub fn watch(&self) -> BroadcastStream<String> {
        BroadcastStream::new(self.changes.subscribe())
    }

    /// Drop one cached policy and notify watchers
    pub fn invalidate(&self, method_id: &str) {
        self.resolved.remove(method_id);
        let _ = self.changes.send(method_id.to_string());
    }

    /// Drop every cached policy and notify watchers per dropped method
    pub fn invalidate_all(&self) {
        let ids: Vec<String> = self.resolved.iter().map(|e| e.key().clone()).collect();
        self.resolved.clear();
        for id in ids {
            let _ = self.changes.send(id);
        }
    }

    /// Stop the source listener tasks
    pub fn shutdown(&self) {
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
    }

    fn merge_for(&self, method_id: &str) -> CachePolicy {
        let sources = self.sources.read();
        let mut fragments: Vec<PolicyFragment> = Vec::with_capacity(sources.len());
        for source in sources.iter() {
            match source.fragment(method_id) {
                Ok(Some(fragment)) => fragments.push(fragment),
                Ok(None) => {}
                Err(e) => {
                    // A failing source contributes nothing for this
                    // resolution; the merge continues with the rest.
                    warn!(source = source.name(), method_id, error = %e, "Policy source failed during resolution");
                }
            }
        }
        merge_fragments(&fragments)
    }
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PolicyResolver {
    fn drop(&mut self) {
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::runtime::{PolicyOverride, RuntimeOverrides};
    use crate::policy::source::{DescriptorSource, ProgrammaticSource};
    use std::time::Duration;

    async fn settle() {
        // Let listener tasks drain pending broadcast events
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn resolves_across_sources_by_priority() {
        let resolver = Arc::new(PolicyResolver::new());

        let descriptors = Arc::new(DescriptorSource::new());
        descriptors.register(
            "M",
            PolicyFragment::new()
                .duration(Duration::from_secs(3600))
                .tag("from-descriptor"),
        );
        let programmatic = Arc::new(ProgrammaticSource::new());
        programmatic
            .method("M")
            .duration(Duration::from_secs(7200))
            .tag("from-programmatic")
            .apply();

        resolver.add_source(descriptors);
        resolver.add_source(programmatic);

        let policy = resolver.resolve("M");
        // Programmatic (30) beats descriptors (10)
        assert_eq!(policy.duration, Duration::from_secs(7200));
        // Tags are additive across sources
        assert!(policy.tags.contains(&"from-programmatic".to_string()));
        assert!(policy.tags.contains(&"from-descriptor".to_string()));
    }

    #[tokio::test]
    async fn runtime_override_wins_and_removal_restores() {
        // GIVEN: descriptor 1h, file-less, programmatic 2h, runtime 5m
        let resolver = Arc::new(PolicyResolver::new());
        let descriptors = Arc::new(DescriptorSource::new());
        descriptors.register("M", PolicyFragment::new().duration(Duration::from_secs(3600)));
        let programmatic = Arc::new(ProgrammaticSource::new());
        programmatic
            .method("M")
            .duration(Duration::from_secs(7200))
            .apply();
        let runtime = Arc::new(RuntimeOverrides::new());

        resolver.add_source(descriptors);
        resolver.add_source(programmatic);
        resolver.add_source(Arc::clone(&runtime) as Arc<dyn PolicySource>);

        runtime.apply_overrides(vec![PolicyOverride::new(
            "M",
            PolicyFragment::new().duration(Duration::from_secs(300)),
        )]);
        settle().await;

        // THEN: the override wins
        assert_eq!(resolver.resolve("M").duration, Duration::from_secs(300));

        // WHEN: the override is removed
        runtime.remove_override("M");
        settle().await;

        // THEN: the next-highest source wins again
        assert_eq!(resolver.resolve("M").duration, Duration::from_secs(7200));
    }

    #[tokio::test]
    async fn change_events_invalidate_cached_policies() {
        let resolver = Arc::new(PolicyResolver::new());
        let programmatic = Arc::new(ProgrammaticSource::new());
        programmatic
            .method("M")
            .duration(Duration::from_secs(60))
            .apply();
        resolver.add_source(Arc::clone(&programmatic) as Arc<dyn PolicySource>);

        assert_eq!(resolver.resolve("M").duration, Duration::from_secs(60));

        programmatic
            .method("M")
            .duration(Duration::from_secs(90))
            .apply();
        settle().await;

        assert_eq!(resolver.resolve("M").duration, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn effective_does_not_populate_the_cache() {
        let resolver = Arc::new(PolicyResolver::new());
        let programmatic = Arc::new(ProgrammaticSource::new());
        programmatic
            .method("M")
            .duration(Duration::from_secs(60))
            .apply();
        resolver.add_source(Arc::clone(&programmatic) as Arc<dyn PolicySource>);

        let _ = resolver.effective("M");
        assert!(resolver.resolved.is_empty());
    }

    #[tokio::test]
    async fn unknown_method_resolves_to_defaults() {
        let resolver = Arc::new(PolicyResolver::new());
        let policy = resolver.resolve("Unknown.Method");
        assert!(policy.enabled);
        assert_eq!(policy.duration, crate::policy::DEFAULT_DURATION);
    }
}
