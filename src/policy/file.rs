//! File-based policy source with hot reload
//!
//! Loads the `MethodCache:` schema (see [`crate::config::PolicyFile`]) and
//! serves per-method fragments at file priority. A background watcher
//! re-parses the file on change (debounced, since editors emit bursts of
//! filesystem events) and emits a snapshot-replace signal so the resolver
//! drops every cached policy. A file that fails to parse is logged and the
//! previous snapshot is retained.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::source::{PolicyEvent, PolicySource, PRIORITY_FILE};
use super::PolicyFragment;
use crate::config::PolicyFile;
use crate::{Error, Result};

const DEBOUNCE: Duration = Duration::from_millis(300);

/// Parsed file content, flattened to method-identity granularity
#[derive(Debug, Default)]
struct LoadedPolicies {
    defaults: Option<PolicyFragment>,
    methods: HashMap<String, PolicyFragment>,
}

impl LoadedPolicies {
    /// Flatten the file schema: `Services.<id>` entries keep their identity;
    /// `Services.<service>.Methods.<method>` becomes `<service>.<method>`.
    fn from_file(file: &PolicyFile, origin: &str) -> Result<Self> {
        let section = &file.method_cache;
        let defaults = section
            .defaults
            .as_ref()
            .map(|d| d.to_fragment(origin))
            .transpose()?;

        let mut methods = HashMap::new();
        for (identity, entry) in &section.services {
            if entry.methods.is_empty() {
                methods.insert(identity.clone(), entry.policy.to_fragment(origin)?);
            } else {
                for (method, policy) in &entry.methods {
                    methods.insert(format!("{identity}.{method}"), policy.to_fragment(origin)?);
                }
            }
        }
        Ok(Self { defaults, methods })
    }

    /// Per-method fragment with defaults filling unset fields; tags union.
    fn fragment(&self, method_id: &str) -> Option<PolicyFragment> {
        let specific = self.methods.get(method_id);
        match (specific, &self.defaults) {
            (None, None) => None,
            (Some(s), None) => Some(s.clone()),
            (None, Some(d)) => Some(d.clone()),
            (Some(s), Some(d)) => {
                let mut merged = s.clone();
                merged.duration = merged.duration.or(d.duration);
                merged.sliding = merged.sliding.or(d.sliding);
                merged.version = merged.version.or(d.version);
                merged.key_generator = merged.key_generator.or(d.key_generator);
                merged.require_idempotent = merged.require_idempotent.or(d.require_idempotent);
                merged.enabled = merged.enabled.or(d.enabled);
                merged.stampede = merged.stampede.or(d.stampede);
                merged.refresh_ahead = merged.refresh_ahead.or(d.refresh_ahead);
                for tag in &d.tags {
                    if !merged.tags.contains(tag) {
                        merged.tags.push(tag.clone());
                    }
                }
                Some(merged)
            }
        }
    }
}

/// Policy source backed by a watched configuration file
pub struct FilePolicySource {
    path: PathBuf,
    snapshot: RwLock<Arc<LoadedPolicies>>,
    events: broadcast::Sender<PolicyEvent>,
    /// Kept alive so the OS watcher is not dropped
    watcher: Mutex<Option<RecommendedWatcher>>,
    cancel: CancellationToken,
}

impl FilePolicySource {
    /// Load the file once and create the source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] when the initial load fails;
    /// without a valid first snapshot there is nothing to serve.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let origin = path.display().to_string();
        if !path.is_file() {
            return Err(Error::config(origin, "policy file not found"));
        }
        let file = PolicyFile::from_path(&path)?;
        let loaded = LoadedPolicies::from_file(&file, &origin)?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(loaded)),
            events,
            watcher: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Re-parse the file and swap the snapshot.
    ///
    /// A parse failure keeps the previous snapshot; policy resolution must
    /// not degrade because an operator saved a broken file.
    pub fn reload(&self) {
        let origin = self.path.display().to_string();
        match PolicyFile::from_path(&self.path)
            .and_then(|file| LoadedPolicies::from_file(&file, &origin))
        {
            Ok(loaded) => {
                *self.snapshot.write() = Arc::new(loaded);
                info!(path = %origin, "Policy file reloaded");
                let _ = self.events.send(PolicyEvent::SnapshotReplaced);
            }
            Err(e) => {
                warn!(path = %origin, error = %e, "Policy file reload failed, keeping previous snapshot");
            }
        }
    }

    /// Start the filesystem watcher.
    ///
    /// Must be called from within a tokio runtime. Watches the file's parent
    /// directory (non-recursive) and debounces event bursts before reloading.
    pub fn start_watching(self: &Arc<Self>) -> Result<()> {
        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<()>(32);
        let watched_path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let Ok(event) = result else { return };
                let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                    && event.paths.iter().any(|p| p == &watched_path);
                if relevant {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::config(self.path.display().to_string(), e.to_string()))?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::config(self.path.display().to_string(), e.to_string()))?;
        *self.watcher.lock() = Some(watcher);

        let source = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut last_event: Option<Instant> = None;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                    }
                    _ = ticker.tick() => {
                        if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                            last_event = None;
                            source.reload();
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        });
        Ok(())
    }

    /// Stop the watcher task
    pub fn stop_watching(&self) {
        self.cancel.cancel();
        *self.watcher.lock() = None;
    }
}

impl Drop for FilePolicySource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl PolicySource for FilePolicySource {
    fn name(&self) -> &str {
        "policy-file"
    }

    fn priority(&self) -> i32 {
        PRIORITY_FILE
    }

    fn fragment(&self, method_id: &str) -> Result<Option<PolicyFragment>> {
        Ok(self.snapshot.read().fragment(method_id))
    }

    fn method_ids(&self) -> Vec<String> {
        self.snapshot.read().methods.keys().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events.subscribe()
    }
}
