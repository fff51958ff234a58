//! Per-entity caches keyed by embedding-provider name.
//!
//! Sentences and documents outlive a single embedding call, and several
//! providers may embed the same objects. Each provider stores what it derived
//! (subword alignment, window bounds) under its own name so that later calls,
//! or later sentences of the same document, read instead of recompute.

use std::collections::HashMap;
use std::ops::Range;

/// A per-name cache owned by a sentence or document.
#[derive(Debug, Clone)]
pub struct NamedCache<T> {
    entries: HashMap<String, T>,
}

impl<T> Default for NamedCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> NamedCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Store `value` under `name` unless an entry already exists.
    ///
    /// Returns true if the value was written.
    pub fn insert_once(&mut self, name: &str, value: T) -> bool {
        if self.entries.contains_key(name) {
            return false;
        }
        self.entries.insert(name.to_string(), value);
        true
    }

    /// Store `value` under `name`, replacing any earlier entry.
    pub fn insert(&mut self, name: &str, value: T) {
        self.entries.insert(name.to_string(), value);
    }

    /// Return the entry for `name`, running `compute` only on a miss.
    ///
    /// A failed computation leaves the cache untouched.
    pub fn get_or_compute<E, F>(&mut self, name: &str, compute: F) -> Result<&T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.entries.contains_key(name) {
            let value = compute()?;
            self.entries.insert(name.to_string(), value);
        }
        Ok(&self.entries[name])
    }

    /// Forget the entry for `name`.
    pub fn invalidate(&mut self, name: &str) {
        self.entries.remove(name);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Subword tokenization of one sentence, aligned to its tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentenceSubwords {
    /// Raw pieces as produced by the tokenizer
    pub pieces: Vec<String>,
    /// Subwords consumed by each token (0 = token has no subwords)
    pub lengths: Vec<usize>,
    /// Ids of the consumed subwords, in order; `ids.len() == lengths.sum()`
    pub ids: Vec<u32>,
}

impl SentenceSubwords {
    /// Number of subwords consumed by the sentence's tokens
    pub fn subword_count(&self) -> usize {
        self.ids.len()
    }

    /// True if the tokenizer produced nothing usable for this sentence.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A sentence's window inside its document, ready to be fed to a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextWindow {
    /// Position of the sentence's first subword inside `input_ids`
    pub start: usize,
    /// One past the sentence's last subword inside `input_ids`
    pub end: usize,
    /// Marker-wrapped window ids
    pub input_ids: Vec<u32>,
}

impl ContextWindow {
    /// Number of the sentence's own subwords inside the window
    pub fn span_len(&self) -> usize {
        self.end - self.start
    }
}

/// Placement of every sentence inside the document-wide subword stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentLayout {
    /// `[doc_sent_start, doc_sent_end)` per sentence, in document order
    pub spans: Vec<Range<usize>>,
    /// Length of the concatenated subword stream
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_compute_runs_once() {
        let mut cache: NamedCache<usize> = NamedCache::new();
        let mut calls = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_compute("bert", || -> Result<usize, ()> {
                    calls += 1;
                    Ok(7)
                })
                .unwrap();
            assert_eq!(*value, 7);
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_failed_compute_is_not_cached() {
        let mut cache: NamedCache<usize> = NamedCache::new();
        let result = cache.get_or_compute("bert", || Err::<usize, &str>("boom"));
        assert!(result.is_err());
        assert!(!cache.contains("bert"));
    }

    #[test]
    fn test_insert_once_keeps_first_value() {
        let mut cache = NamedCache::new();
        assert!(cache.insert_once("a", 1));
        assert!(!cache.insert_once("a", 2));
        assert_eq!(cache.get("a"), Some(&1));
    }

    #[test]
    fn test_insert_replaces_value() {
        let mut cache = NamedCache::new();
        cache.insert_once("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.get("a"), Some(&2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_names_are_independent() {
        let mut cache = NamedCache::new();
        cache.insert_once("a", 1);
        cache.insert_once("b", 2);
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(&2));
        assert_eq!(cache.len(), 1);
    }
}
