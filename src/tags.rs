//! Tag index: bulk-invalidation bookkeeping
//!
//! Maintains the bidirectional mapping between tags and live cache keys.
//! Both directions are kept under one lock so an invalidation observer never
//! sees a key associated in one direction but not the other. Pattern removal
//! uses glob semantics (`*` any run of characters, `?` one character).

use std::collections::{HashMap, HashSet};

use glob::Pattern;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct TagMaps {
    by_tag: HashMap<String, HashSet<String>>,
    by_key: HashMap<String, HashSet<String>>,
}

/// Bidirectional tag ↔ key index
#[derive(Debug, Default)]
pub struct TagIndex {
    inner: Mutex<TagMaps>,
}

impl TagIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `key` with each tag in `tags`
    pub fn associate(&self, key: &str, tags: &[String]) {
        if tags.is_empty() {
            return;
        }
        let mut maps = self.inner.lock();
        for tag in tags {
            maps.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        maps.by_key
            .entry(key.to_string())
            .or_default()
            .extend(tags.iter().cloned());
    }

    /// Drop every association for `key`.
    ///
    /// Called whenever a key is removed from any layer so the index never
    /// holds dangling references.
    pub fn dissociate(&self, key: &str) {
        let mut maps = self.inner.lock();
        if let Some(tags) = maps.by_key.remove(key) {
            for tag in tags {
                if let Some(keys) = maps.by_tag.get_mut(&tag) {
                    keys.remove(key);
                    if keys.is_empty() {
                        maps.by_tag.remove(&tag);
                    }
                }
            }
        }
    }

    /// Keys currently associated with `tag`
    #[must_use]
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.inner
            .lock()
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove `tag`, returning the keys that carried it at the moment of the
    /// call. Entries tagged afterwards are unaffected.
    pub fn remove_by_tag(&self, tag: &str) -> Vec<String> {
        let mut maps = self.inner.lock();
        let Some(keys) = maps.by_tag.remove(tag) else {
            return Vec::new();
        };
        let keys: Vec<String> = keys.into_iter().collect();
        for key in &keys {
            if let Some(tags) = maps.by_key.get_mut(key) {
                tags.remove(tag);
                if tags.is_empty() {
                    maps.by_key.remove(key);
                }
            }
        }
        keys
    }

    /// Remove every tag matching the glob `pattern`, returning
    /// `(matched tags, affected keys)`.
    ///
    /// An invalid pattern matches nothing.
    pub fn remove_by_tag_pattern(&self, pattern: &str) -> (Vec<String>, Vec<String>) {
        let Ok(compiled) = Pattern::new(pattern) else {
            return (Vec::new(), Vec::new());
        };
        let matched: Vec<String> = {
            let maps = self.inner.lock();
            maps.by_tag
                .keys()
                .filter(|tag| compiled.matches(tag))
                .cloned()
                .collect()
        };

        let mut keys: Vec<String> = Vec::new();
        for tag in &matched {
            for key in self.remove_by_tag(tag) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        (matched, keys)
    }

    /// Tags currently associated with `key`
    #[must_use]
    pub fn tags_for_key(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .by_key
            .get(key)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every association
    pub fn clear(&self) {
        let mut maps = self.inner.lock();
        maps.by_tag.clear();
        maps.by_key.clear();
    }

    /// Number of distinct live tags
    #[must_use]
    pub fn tag_count(&self) -> usize {
        self.inner.lock().by_tag.len()
    }
}
