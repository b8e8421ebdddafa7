//! Policy sources: producers of per-method policy fragments
//!
//! A [`PolicySource`] owns a snapshot of `(method identity → fragment)` and a
//! change stream the resolver subscribes to. Sources are ranked by priority;
//! the well-known tiers are descriptors (10), config files (20), programmatic
//! registration (30), and runtime overrides (40).

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::PolicyFragment;
use crate::Result;

/// Priority of host-registered method descriptors (the annotation analog)
pub const PRIORITY_DESCRIPTOR: i32 = 10;
/// Priority of file-based configuration
pub const PRIORITY_FILE: i32 = 20;
/// Priority of programmatic registration
pub const PRIORITY_PROGRAMMATIC: i32 = 30;
/// Priority of runtime overrides (highest)
pub const PRIORITY_RUNTIME: i32 = 40;

/// Change notification emitted by a source
#[derive(Debug, Clone)]
pub enum PolicyEvent {
    /// One method's contribution changed
    Changed(String),
    /// The whole snapshot was replaced; all resolved policies are stale
    SnapshotReplaced,
}

/// A contributor of policy fragments for method identities
pub trait PolicySource: Send + Sync {
    /// Source name used in logs and configuration errors
    fn name(&self) -> &str;

    /// Merge priority; higher wins field-level merges
    fn priority(&self) -> i32;

    /// This source's contribution for one method identity.
    ///
    /// # Errors
    ///
    /// Sources may fail transiently; the resolver logs the failure and treats
    /// the source as contributing nothing for that resolution.
    fn fragment(&self, method_id: &str) -> Result<Option<PolicyFragment>>;

    /// Method identities this source knows about
    fn method_ids(&self) -> Vec<String>;

    /// Subscribe to change notifications
    fn subscribe(&self) -> broadcast::Receiver<PolicyEvent>;
}

/// Shared snapshot storage backing the in-process sources
#[derive(Debug)]
pub(crate) struct Snapshot {
    fragments: DashMap<String, PolicyFragment>,
    events: broadcast::Sender<PolicyEvent>,
}

impl Snapshot {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            fragments: DashMap::new(),
            events,
        }
    }

    pub(crate) fn insert(&self, method_id: String, fragment: PolicyFragment) {
        self.fragments.insert(method_id.clone(), fragment);
        let _ = self.events.send(PolicyEvent::Changed(method_id));
    }

    pub(crate) fn remove(&self, method_id: &str) -> Option<PolicyFragment> {
        let removed = self.fragments.remove(method_id).map(|(_, v)| v);
        if removed.is_some() {
            let _ = self.events.send(PolicyEvent::Changed(method_id.to_string()));
        }
        removed
    }

    pub(crate) fn replace_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, PolicyFragment)>,
    {
        self.fragments.clear();
        for (method_id, fragment) in entries {
            self.fragments.insert(method_id, fragment);
        }
        let _ = self.events.send(PolicyEvent::SnapshotReplaced);
    }

    pub(crate) fn clear(&self) {
        self.fragments.clear();
        let _ = self.events.send(PolicyEvent::SnapshotReplaced);
    }

    pub(crate) fn get(&self, method_id: &str) -> Option<PolicyFragment> {
        self.fragments.get(method_id).map(|f| f.clone())
    }

    pub(crate) fn entries(&self) -> Vec<(String, PolicyFragment)> {
        self.fragments
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub(crate) fn method_ids(&self) -> Vec<String> {
        self.fragments.iter().map(|e| e.key().clone()).collect()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events.subscribe()
    }
}

/// Host-registered method descriptors.
///
/// Hosts that scan annotations, run a source generator, or register methods
/// explicitly feed the results in here; the resolver does not care which.
#[derive(Debug)]
pub struct DescriptorSource {
    snapshot: Snapshot,
}

impl DescriptorSource {
    /// Create an empty descriptor source
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: Snapshot::new(),
        }
    }

    /// Register (or replace) the descriptor for one method
    pub fn register(&self, method_id: impl Into<String>, fragment: PolicyFragment) {
        self.snapshot.insert(method_id.into(), fragment);
    }

    /// Remove a method's descriptor
    pub fn unregister(&self, method_id: &str) {
        self.snapshot.remove(method_id);
    }
}

impl Default for DescriptorSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicySource for DescriptorSource {
    fn name(&self) -> &str {
        "descriptors"
    }

    fn priority(&self) -> i32 {
        PRIORITY_DESCRIPTOR
    }

    fn fragment(&self, method_id: &str) -> Result<Option<PolicyFragment>> {
        Ok(self.snapshot.get(method_id))
    }

    fn method_ids(&self) -> Vec<String> {
        self.snapshot.method_ids()
    }

    fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.snapshot.subscribe()
    }
}

/// Programmatic policy registration with a fluent builder
///
/// ```
/// use std::time::Duration;
/// use method_cache::policy::source::ProgrammaticSource;
///
/// let source = ProgrammaticSource::new();
/// source
///     .method("UserService.GetUser")
///     .duration(Duration::from_secs(120))
///     .tag("users")
///     .apply();
/// ```
#[derive(Debug)]
pub struct ProgrammaticSource {
    snapshot: Snapshot,
}

impl ProgrammaticSource {
    /// Create an empty programmatic source
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: Snapshot::new(),
        }
    }

    /// Start a fluent policy definition for `method_id`
    #[must_use]
    pub fn method(&self, method_id: impl Into<String>) -> MethodPolicyBuilder<'_> {
        MethodPolicyBuilder {
            source: self,
            method_id: method_id.into(),
            fragment: PolicyFragment::new(),
        }
    }

    /// Set a method's contribution directly
    pub fn set(&self, method_id: impl Into<String>, fragment: PolicyFragment) {
        self.snapshot.insert(method_id.into(), fragment);
    }

    /// Remove a method's contribution
    pub fn unset(&self, method_id: &str) {
        self.snapshot.remove(method_id);
    }
}

impl Default for ProgrammaticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicySource for ProgrammaticSource {
    fn name(&self) -> &str {
        "programmatic"
    }

    fn priority(&self) -> i32 {
        PRIORITY_PROGRAMMATIC
    }

    fn fragment(&self, method_id: &str) -> Result<Option<PolicyFragment>> {
        Ok(self.snapshot.get(method_id))
    }

    fn method_ids(&self) -> Vec<String> {
        self.snapshot.method_ids()
    }

    fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.snapshot.subscribe()
    }
}

/// Fluent builder returned by [`ProgrammaticSource::method`]
pub struct MethodPolicyBuilder<'a> {
    source: &'a ProgrammaticSource,
    method_id: String,
    fragment: PolicyFragment,
}

impl MethodPolicyBuilder<'_> {
    /// Set the TTL
    #[must_use]
    pub fn duration(mut self, duration: std::time::Duration) -> Self {
        self.fragment = self.fragment.duration(duration);
        self
    }

    /// Set the sliding-expiration window
    #[must_use]
    pub fn sliding(mut self, window: std::time::Duration) -> Self {
        self.fragment = self.fragment.sliding(window);
        self
    }

    /// Add a tag
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.fragment = self.fragment.tag(tag);
        self
    }

    /// Set the version
    #[must_use]
    pub fn version(mut self, version: i64) -> Self {
        self.fragment = self.fragment.version(version);
        self
    }

    /// Require idempotency assertions
    #[must_use]
    pub fn require_idempotent(mut self) -> Self {
        self.fragment = self.fragment.require_idempotent(true);
        self
    }

    /// Set the stampede mode
    #[must_use]
    pub fn stampede(mut self, mode: super::StampedeMode) -> Self {
        self.fragment = self.fragment.stampede(mode);
        self
    }

    /// Commit the definition to the source
    pub fn apply(self) {
        self.source.set(self.method_id, self.fragment);
    }
}
