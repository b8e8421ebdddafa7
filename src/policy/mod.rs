//! Per-method cache policies and the multi-source resolution pipeline
//!
//! A [`CachePolicy`] is the effective contract for one method identity. It is
//! produced by merging [`PolicyFragment`]s contributed by registered
//! [`source::PolicySource`]s in priority order: descriptors (10), config
//! files (20), programmatic registration (30), runtime overrides (40).
//!
//! Merge rules: for each field the highest-priority source that supplies a
//! value wins; tags are additive across all sources; predicates compose by
//! conjunction; the idempotency requirement is the logical OR of all
//! contributions.

pub mod file;
pub mod resolver;
pub mod runtime;
pub mod source;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::key::KeyGeneratorKind;

/// Default TTL applied when no source supplies a duration
pub const DEFAULT_DURATION: Duration = Duration::from_secs(5 * 60);

/// Stampede-protection mode for cache misses
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StampedeMode {
    /// No protection; every concurrent miss invokes the factory
    None,
    /// One factory execution per miss; concurrent callers share the result
    SingleFlight,
    /// XFetch-style probabilistic early refresh tuned by `beta`; refreshes
    /// run under single-flight while other callers serve the stale entry
    Probabilistic {
        /// Refresh eagerness; 1.0 is the published sweet spot, higher
        /// refreshes earlier
        beta: f64,
    },
}

/// Context handed to policy predicates for one call site
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    /// Stable method identity
    pub method_id: &'a str,
    /// Ordered argument values
    pub args: &'a [Value],
}

/// Predicate function gating whether a call is cached at all
pub type PredicateFn = dyn Fn(&CallSite<'_>) -> bool + Send + Sync;

/// A conjunction of predicates collected across policy sources
#[derive(Clone, Default)]
pub struct Predicates(Vec<Arc<PredicateFn>>);

impl Predicates {
    /// Add one predicate to the conjunction
    pub fn push(&mut self, predicate: Arc<PredicateFn>) {
        self.0.push(predicate);
    }

    /// Evaluate the conjunction; an empty set always passes
    #[must_use]
    pub fn evaluate(&self, site: &CallSite<'_>) -> bool {
        self.0.iter().all(|p| p(site))
    }

    /// Whether any predicates are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Predicates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicates({})", self.0.len())
    }
}

/// Effective, fully-resolved policy for one method identity
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Entry TTL
    pub duration: Duration,
    /// Sliding-expiration window
    pub sliding: Option<Duration>,
    /// Tags attached to every entry written under this policy
    pub tags: Vec<String>,
    /// Version; non-zero versions suffix the cache key with `_v{n}`
    pub version: i64,
    /// Fingerprint algorithm
    pub key_generator: KeyGeneratorKind,
    /// When true, call sites must assert idempotency or fail
    pub require_idempotent: bool,
    /// When false, calls bypass the cache entirely
    pub enabled: bool,
    /// Stampede-protection mode
    pub stampede: StampedeMode,
    /// Background-refresh window: refresh when remaining TTL drops below it
    pub refresh_ahead: Option<Duration>,
    /// Caching gate evaluated per call
    pub predicates: Predicates,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            duration: DEFAULT_DURATION,
            sliding: None,
            tags: Vec::new(),
            version: 0,
            key_generator: KeyGeneratorKind::default(),
            require_idempotent: false,
            enabled: true,
            stampede: StampedeMode::SingleFlight,
            refresh_ahead: None,
            predicates: Predicates::default(),
        }
    }
}

/// One source's contribution to a method's policy.
///
/// `None` fields contribute nothing and let lower-priority sources win.
#[derive(Debug, Clone, Default)]
pub struct PolicyFragment {
    /// TTL contribution
    pub duration: Option<Duration>,
    /// Sliding-window contribution
    pub sliding: Option<Duration>,
    /// Additive tag contributions
    pub tags: Vec<String>,
    /// Version contribution
    pub version: Option<i64>,
    /// Key-generator contribution
    pub key_generator: Option<KeyGeneratorKind>,
    /// Idempotency-requirement contribution (OR-ed across sources)
    pub require_idempotent: Option<bool>,
    /// Enabled-flag contribution
    pub enabled: Option<bool>,
    /// Stampede-mode contribution
    pub stampede: Option<StampedeMode>,
    /// Refresh-ahead contribution
    pub refresh_ahead: Option<Duration>,
    /// Predicate contributions (conjoined across sources)
    pub predicates: Predicates,
}

impl PolicyFragment {
    /// Empty fragment
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this fragment contributes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.duration.is_none()
            && self.sliding.is_none()
            && self.tags.is_empty()
            && self.version.is_none()
            && self.key_generator.is_none()
            && self.require_idempotent.is_none()
            && self.enabled.is_none()
            && self.stampede.is_none()
            && self.refresh_ahead.is_none()
            && self.predicates.is_empty()
    }

    // Fluent construction, used by the programmatic source and runtime
    // overrides.

    /// Set the TTL
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Set the sliding-expiration window
    #[must_use]
    pub fn sliding(mut self, window: Duration) -> Self {
        self.sliding = Some(window);
        self
    }

    /// Add one tag
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add several tags
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Set the version
    #[must_use]
    pub fn version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Set the key generator
    #[must_use]
    pub fn key_generator(mut self, kind: KeyGeneratorKind) -> Self {
        self.key_generator = Some(kind);
        self
    }

    /// Require idempotency assertions from call sites
    #[must_use]
    pub fn require_idempotent(mut self, required: bool) -> Self {
        self.require_idempotent = Some(required);
        self
    }

    /// Enable or disable caching
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set the stampede mode
    #[must_use]
    pub fn stampede(mut self, mode: StampedeMode) -> Self {
        self.stampede = Some(mode);
        self
    }

    /// Set the refresh-ahead window
    #[must_use]
    pub fn refresh_ahead(mut self, window: Duration) -> Self {
        self.refresh_ahead = Some(window);
        self
    }

    /// Add a caching predicate
    #[must_use]
    pub fn predicate(mut self, predicate: Arc<PredicateFn>) -> Self {
        self.predicates.push(predicate);
        self
    }
}

/// Merge fragments ordered by priority descending into an effective policy.
///
/// The first fragment supplying a field wins it; tags are unioned in
/// first-seen order; idempotency requirements OR; predicates conjoin.
#[must_use]
pub fn merge_fragments(fragments: &[PolicyFragment]) -> CachePolicy {
    let mut policy = CachePolicy::default();

    let mut duration = None;
    let mut sliding = None;
    let mut version = None;
    let mut key_generator = None;
    let mut enabled = None;
    let mut stampede = None;
    let mut refresh_ahead = None;
    let mut require_idempotent = false;
    let mut tags: Vec<String> = Vec::new();
    let mut predicates = Predicates::default();

    for fragment in fragments {
        duration = duration.or(fragment.duration);
        sliding = sliding.or(fragment.sliding);
        version = version.or(fragment.version);
        key_generator = key_generator.or(fragment.key_generator);
        enabled = enabled.or(fragment.enabled);
        stampede = stampede.or(fragment.stampede);
        refresh_ahead = refresh_ahead.or(fragment.refresh_ahead);
        require_idempotent |= fragment.require_idempotent.unwrap_or(false);
        for tag in &fragment.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        for predicate in &fragment.predicates.0 {
            predicates.push(Arc::clone(predicate));
        }
    }

    policy.duration = duration.unwrap_or(DEFAULT_DURATION);
    policy.sliding = sliding;
    policy.version = version.unwrap_or(0);
    policy.key_generator = key_generator.unwrap_or_default();
    policy.enabled = enabled.unwrap_or(true);
    policy.stampede = stampede.unwrap_or(StampedeMode::SingleFlight);
    policy.refresh_ahead = refresh_ahead;
    policy.require_idempotent = require_idempotent;
    policy.tags = tags;
    policy.predicates = predicates;
    policy
}

/// Overlay a per-call override fragment on top of a resolved policy.
pub(crate) fn apply_override(policy: &CachePolicy, fragment: &PolicyFragment) -> CachePolicy {
    let mut merged = policy.clone();
    if let Some(d) = fragment.duration {
        merged.duration = d;
    }
    if let Some(s) = fragment.sliding {
        merged.sliding = Some(s);
    }
    if let Some(v) = fragment.version {
        merged.version = v;
    }
    if let Some(k) = fragment.key_generator {
        merged.key_generator = k;
    }
    if let Some(e) = fragment.enabled {
        merged.enabled = e;
    }
    if let Some(m) = fragment.stampede {
        merged.stampede = m;
    }
    if let Some(r) = fragment.refresh_ahead {
        merged.refresh_ahead = Some(r);
    }
    if fragment.require_idempotent == Some(true) {
        merged.require_idempotent = true;
    }
    for tag in &fragment.tags {
        if !merged.tags.contains(tag) {
            merged.tags.push(tag.clone());
        }
    }
    for predicate in &fragment.predicates.0 {
        merged.predicates.push(Arc::clone(predicate));
    }
    merged
}
