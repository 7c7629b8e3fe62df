//! Per-document BM25 statistics with a lazily maintained corpus average.

use coderag_core::token_counts;
use std::collections::HashMap;

/// Length and term frequencies for one indexed document's snippet.
#[derive(Debug, Clone, Default)]
pub struct DocStats {
    /// Character count of the snippet.
    pub doc_length: usize,
    pub term_frequencies: HashMap<String, usize>,
}

/// BM25 statistics cache, keyed by arena index. `avg_doc_length` is memoized
/// behind a dirty flag and recomputed on the first read after any mutation.
#[derive(Default)]
pub struct Bm25Stats {
    docs: HashMap<usize, DocStats>,
    avg_doc_length: f32,
    dirty: bool,
}

impl Bm25Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) stats for the entry in `index`.
    pub fn upsert(&mut self, index: usize, snippet: &str) {
        self.docs.insert(
            index,
            DocStats { doc_length: snippet.len(), term_frequencies: token_counts(snippet) },
        );
        self.dirty = true;
    }

    pub fn remove(&mut self, index: usize) {
        if self.docs.remove(&index).is_some() {
            self.dirty = true;
        }
    }

    pub fn clear(&mut self) {
        self.docs.clear();
        self.avg_doc_length = 0.0;
        self.dirty = false;
    }

    pub fn doc(&self, index: usize) -> Option<&DocStats> {
        self.docs.get(&index)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Average snippet length over all tracked documents.
    pub fn avg_doc_length(&mut self) -> f32 {
        if self.dirty {
            self.avg_doc_length = if self.docs.is_empty() {
                0.0
            } else {
                let total: usize = self.docs.values().map(|d| d.doc_length).sum();
                total as f32 / self.docs.len() as f32
            };
            self.dirty = false;
        }
        self.avg_doc_length
    }

    /// Document frequency of `term` within `candidates` (the population BM25
    /// IDF is computed over).
    pub fn doc_freq_among(&self, term: &str, candidates: &[usize]) -> usize {
        candidates
            .iter()
            .filter(|&&i| {
                self.docs.get(&i).map(|d| d.term_frequencies.contains_key(term)).unwrap_or(false)
            })
            .count()
    }

    /// Rough in-memory footprint in bytes.
    pub fn memory_estimate(&self) -> usize {
        self.docs
            .values()
            .map(|d| 48 + d.term_frequencies.iter().map(|(t, _)| t.len() + 24).sum::<usize>())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_avg() {
        let mut stats = Bm25Stats::new();
        stats.upsert(0, "aa bb");
        stats.upsert(1, "cc dd ee ff");
        assert_eq!(stats.doc(0).unwrap().doc_length, 5);
        let avg = stats.avg_doc_length();
        assert!((avg - (5.0 + 11.0) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_avg_recomputed_after_remove() {
        let mut stats = Bm25Stats::new();
        stats.upsert(0, "aaaa");
        stats.upsert(1, "bbbbbbbb");
        let _ = stats.avg_doc_length();
        stats.remove(1);
        assert!((stats.avg_doc_length() - 4.0).abs() < 1e-6);
        stats.remove(0);
        assert_eq!(stats.avg_doc_length(), 0.0);
        assert!(stats.is_empty());
    }

    #[test]
    fn test_term_frequencies() {
        let mut stats = Bm25Stats::new();
        stats.upsert(3, "foo bar foo");
        let doc = stats.doc(3).unwrap();
        assert_eq!(doc.term_frequencies["foo"], 2);
        assert_eq!(doc.term_frequencies["bar"], 1);
    }

    #[test]
    fn test_doc_freq_among() {
        let mut stats = Bm25Stats::new();
        stats.upsert(0, "alpha beta");
        stats.upsert(1, "alpha gamma");
        stats.upsert(2, "delta");
        assert_eq!(stats.doc_freq_among("alpha", &[0, 1, 2]), 2);
        assert_eq!(stats.doc_freq_among("alpha", &[2]), 0);
    }
}
