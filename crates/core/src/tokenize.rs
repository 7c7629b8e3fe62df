//! Lowercase alphanumeric-plus-underscore tokenization with LRU memoization.
//!
//! `tokenize` runs at every scoring step, so the contract is O(|s|) with a single
//! pass over the input and no regex machinery. The `TokenCache` memoizes results
//! by input string for the hot paths (query canonicalization, repeated snippets).

use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Default capacity of the tokenization memo.
pub const TOKEN_CACHE_CAPACITY: usize = 10_000;

/// Split `text` into its set of lowercase `[a-z0-9_]+` tokens.
///
/// Uppercase ASCII is folded to lowercase in place; every other character is a
/// separator. Empty tokens are dropped.
pub fn tokenize(text: &str) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let mut current = String::new();
    for c in text.chars() {
        match c {
            'a'..='z' | '0'..='9' | '_' => current.push(c),
            'A'..='Z' => current.push(c.to_ascii_lowercase()),
            _ => {
                if !current.is_empty() {
                    tokens.insert(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        tokens.insert(current);
    }
    tokens
}

/// Like [`tokenize`], but counts occurrences per token. Used to build the
/// per-document term-frequency maps for BM25.
pub fn token_counts(text: &str) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut current = String::new();
    for c in text.chars() {
        match c {
            'a'..='z' | '0'..='9' | '_' => current.push(c),
            'A'..='Z' => current.push(c.to_ascii_lowercase()),
            _ => {
                if !current.is_empty() {
                    *counts.entry(std::mem::take(&mut current)).or_insert(0) += 1;
                }
            }
        }
    }
    if !current.is_empty() {
        *counts.entry(current).or_insert(0) += 1;
    }
    counts
}

/// Bounded memo over [`tokenize`], keyed by the input string.
///
/// Token sets are shared via `Arc` so cache hits cost one clone of a pointer.
pub struct TokenCache {
    inner: Mutex<LruCache<String, Arc<HashSet<String>>>>,
}

impl TokenCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { inner: Mutex::new(LruCache::new(cap)) }
    }

    /// Tokenize `text`, consulting the memo first.
    pub fn tokens(&self, text: &str) -> Arc<HashSet<String>> {
        let mut cache = self.inner.lock().unwrap();
        if let Some(hit) = cache.get(text) {
            return Arc::clone(hit);
        }
        let computed = Arc::new(tokenize(text));
        cache.put(text.to_string(), Arc::clone(&computed));
        computed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(TOKEN_CACHE_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
