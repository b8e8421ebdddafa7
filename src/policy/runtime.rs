//! Runtime policy overrides: the hot-swappable, highest-priority source
//!
//! Operators apply overrides at runtime (typically through a management
//! surface the host exposes); each change is published to the resolver,
//! which drops the affected resolved policies so the next call observes the
//! new contract. Re-applying the same override set is idempotent.

use tokio::sync::broadcast;

use super::source::{PolicyEvent, PolicySource, PRIORITY_RUNTIME, Snapshot};
use super::PolicyFragment;
use crate::Result;

/// A named override to apply: method identity plus its policy contribution
#[derive(Debug, Clone)]
pub struct PolicyOverride {
    /// Method identity the override targets
    pub method_id: String,
    /// Fields to override
    pub fragment: PolicyFragment,
}

impl PolicyOverride {
    /// Create an override for one method
    #[must_use]
    pub fn new(method_id: impl Into<String>, fragment: PolicyFragment) -> Self {
        Self {
            method_id: method_id.into(),
            fragment,
        }
    }
}

/// Hot-swappable top-priority policy store
#[derive(Debug)]
pub struct RuntimeOverrides {
    snapshot: Snapshot,
}

impl RuntimeOverrides {
    /// Create an empty override store
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: Snapshot::new(),
        }
    }

    /// Apply a batch of overrides; later entries for the same method win
    pub fn apply_overrides(&self, overrides: Vec<PolicyOverride>) {
        for o in overrides {
            self.snapshot.insert(o.method_id, o.fragment);
        }
    }

    /// Remove the override for one method, if any
    pub fn remove_override(&self, method_id: &str) -> bool {
        self.snapshot.remove(method_id).is_some()
    }

    /// Drop every override
    pub fn clear_overrides(&self) {
        self.snapshot.clear();
    }

    /// Current override list
    #[must_use]
    pub fn get_overrides(&self) -> Vec<PolicyOverride> {
        self.snapshot
            .entries()
            .into_iter()
            .map(|(method_id, fragment)| PolicyOverride { method_id, fragment })
            .collect()
    }
}

impl Default for RuntimeOverrides {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicySource for RuntimeOverrides {
    fn name(&self) -> &str {
        "runtime-overrides"
    }

    fn priority(&self) -> i32 {
        PRIORITY_RUNTIME
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
