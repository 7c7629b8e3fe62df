//! Multi-index store: entry arena plus the inverted posting maps.
//!
//! Posting sets hold plain integer indices into the entry arena (arena-plus-index,
//! no ownership cycles). Slots freed by deletion are reused so indices stay stable
//! across incremental updates; the watcher reuses an existing slot through the
//! path index for O(1) in-place replacement.

use crate::types::{
    ancestor_dirs, canon_uri, uri_extension, IndexEntry, EMPTY_QUERY_CANDIDATE_CAP,
    INTERSECTION_RECALL_FLOOR, UNION_AUGMENT_CAP,
};
use std::collections::{HashMap, HashSet};

/// Sets at or below this size intersect via hash membership; larger ones take
/// the sorted-merge path.
const MERGE_INTERSECT_THRESHOLD: usize = 512;

#[derive(Default)]
pub struct IndexStore {
    entries: Vec<Option<IndexEntry>>,
    free_slots: Vec<usize>,
    term_index: HashMap<String, HashSet<usize>>,
    symbol_index: HashMap<String, HashSet<usize>>,
    language_index: HashMap<String, HashSet<usize>>,
    path_hierarchy_index: HashMap<String, HashSet<usize>>,
    symbol_relationship_index: HashMap<String, HashSet<usize>>,
    path_index: HashMap<String, usize>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Entry access
    // -----------------------------------------------------------------------

    pub fn entry(&self, index: usize) -> Option<&IndexEntry> {
        self.entries.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn entry_mut(&mut self, index: usize) -> Option<&mut IndexEntry> {
        self.entries.get_mut(index).and_then(|slot| slot.as_mut())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len() - self.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live `(index, entry)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &IndexEntry)> {
        self.entries.iter().enumerate().filter_map(|(i, slot)| slot.as_ref().map(|e| (i, e)))
    }

    /// Arena index for a URI, via the unique path index.
    pub fn index_of(&self, uri: &str) -> Option<usize> {
        self.path_index.get(&canon_uri(uri)).copied()
    }

    pub fn term_count(&self) -> usize {
        self.term_index.len()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbol_index.len()
    }

    /// Rough in-memory footprint of entries plus posting maps.
    pub fn memory_estimate(&self) -> usize {
        let entries: usize = self.iter().map(|(_, e)| e.memory_estimate()).sum();
        let postings: usize = [
            &self.term_index,
            &self.symbol_index,
            &self.language_index,
            &self.path_hierarchy_index,
            &self.symbol_relationship_index,
        ]
        .iter()
        .map(|m| m.iter().map(|(k, v)| k.len() + v.len() * 8 + 48).sum::<usize>())
        .sum();
        entries + postings + self.path_index.len() * 64
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Add a new entry, reusing a freed slot when one exists. If the URI is
    /// already indexed, the existing entry is replaced in place instead.
    pub fn add(&mut self, mut entry: IndexEntry) -> usize {
        if entry.token_sets_missing() {
            entry.rebuild_token_sets();
        }
        if let Some(existing) = self.index_of(&entry.uri) {
            self.replace(existing, entry);
            return existing;
        }
        let index = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.entries.push(None);
                self.entries.len() - 1
            }
        };
        self.insert_postings(index, &entry);
        self.entries[index] = Some(entry);
        index
    }

    /// Replace the entry in `index`, refreshing every posting set.
    pub fn replace(&mut self, index: usize, mut entry: IndexEntry) {
        if entry.token_sets_missing() {
            entry.rebuild_token_sets();
        }
        if let Some(old) = self.entries.get(index).and_then(|s| s.as_ref()) {
            let old = old.clone();
            self.remove_postings(index, &old);
        }
        self.insert_postings(index, &entry);
        self.entries[index] = Some(entry);
    }

    /// Remove the entry in `index` from the arena and from every posting set.
    pub fn remove(&mut self, index: usize) -> Option<IndexEntry> {
        let entry = self.entries.get_mut(index)?.take()?;
        self.remove_postings(index, &entry);
        self.free_slots.push(index);
        Some(entry)
    }

    pub fn remove_by_uri(&mut self, uri: &str) -> Option<IndexEntry> {
        let index = self.index_of(uri)?;
        self.remove(index)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.free_slots.clear();
        self.clear_postings();
    }

    fn clear_postings(&mut self) {
        self.term_index.clear();
        self.symbol_index.clear();
        self.language_index.clear();
        self.path_hierarchy_index.clear();
        self.symbol_relationship_index.clear();
        self.path_index.clear();
    }

    /// Clear all posting maps and re-derive them from the live entries,
    /// recomputing any missing pre-computed token sets along the way.
    pub fn rebuild_all(&mut self) {
        self.clear_postings();
        for index in 0..self.entries.len() {
            let needs_tokens =
                self.entries[index].as_ref().map(|e| e.token_sets_missing()).unwrap_or(false);
            if needs_tokens {
                if let Some(entry) = self.entries[index].as_mut() {
                    entry.rebuild_token_sets();
                }
            }
            if let Some(entry) = self.entries[index].take() {
                self.insert_postings(index, &entry);
                self.entries[index] = Some(entry);
            }
        }
    }

    fn insert_postings(&mut self, index: usize, entry: &IndexEntry) {
        let canon = canon_uri(&entry.uri);

        for token in entry
            .snippet_tokens
            .iter()
            .chain(entry.uri_tokens.iter())
            .chain(entry.symbol_tokens.iter())
        {
            self.term_index.entry(token.clone()).or_default().insert(index);
        }
        for symbol in &entry.symbols {
            self.symbol_index.entry(symbol.to_lowercase()).or_default().insert(index);
        }
        if let Some(ext) = uri_extension(&entry.uri) {
            self.language_index.entry(ext).or_default().insert(index);
        }
        for dir in ancestor_dirs(&canon) {
            self.path_hierarchy_index.entry(dir).or_default().insert(index);
        }
        for name in entry.imported_symbols.iter().chain(entry.imported_from.iter()) {
            self.symbol_relationship_index.entry(name.to_lowercase()).or_default().insert(index);
        }
        self.path_index.insert(canon, index);
    }

    fn remove_postings(&mut self, index: usize, entry: &IndexEntry) {
        let canon = canon_uri(&entry.uri);

        for token in entry
            .snippet_tokens
            .iter()
            .chain(entry.uri_tokens.iter())
            .chain(entry.symbol_tokens.iter())
        {
            remove_posting(&mut self.term_index, token, index);
        }
        for symbol in &entry.symbols {
            remove_posting(&mut self.symbol_index, &symbol.to_lowercase(), index);
        }
        if let Some(ext) = uri_extension(&entry.uri) {
            remove_posting(&mut self.language_index, &ext, index);
        }
        for dir in ancestor_dirs(&canon) {
            remove_posting(&mut self.path_hierarchy_index, &dir, index);
        }
        for name in entry.imported_symbols.iter().chain(entry.imported_from.iter()) {
            remove_posting(&mut self.symbol_relationship_index, &name.to_lowercase(), index);
        }
        if self.path_index.get(&canon) == Some(&index) {
            self.path_index.remove(&canon);
        }
    }

    // -----------------------------------------------------------------------
    // Candidate selection
    // -----------------------------------------------------------------------

    /// Entries in a directory subtree, via the path-hierarchy index.
    pub fn entries_under(&self, dir: &str) -> Option<&HashSet<usize>> {
        self.path_hierarchy_index.get(&canon_uri(dir))
    }

    /// Entries with a given extension.
    pub fn entries_with_language(&self, ext: &str) -> Option<&HashSet<usize>> {
        self.language_index.get(&ext.to_lowercase())
    }

    pub fn term_postings(&self, token: &str) -> Option<&HashSet<usize>> {
        self.term_index.get(token)
    }

    /// Select candidate entries for a tokenized query.
    ///
    /// 0 tokens: a bounded prefix of live indices. 1 token: term ∪ symbol
    /// postings. 2+ tokens: the intersection of term postings for precision,
    /// unioned with the intersection of symbol postings; when the term
    /// intersection is small, augmented with a bounded slice of the term-posting
    /// union for recall.
    pub fn candidates(&self, query_tokens: &[String]) -> Vec<usize> {
        match query_tokens.len() {
            0 => self.iter().map(|(i, _)| i).take(EMPTY_QUERY_CANDIDATE_CAP).collect(),
            1 => {
                let token = &query_tokens[0];
                let mut result: HashSet<usize> = HashSet::new();
                if let Some(postings) = self.term_index.get(token) {
                    result.extend(postings);
                }
                if let Some(postings) = self.symbol_index.get(token) {
                    result.extend(postings);
                }
                let mut out: Vec<usize> = result.into_iter().collect();
                out.sort_unstable();
                out
            }
            _ => self.multi_token_candidates(query_tokens),
        }
    }

    fn multi_token_candidates(&self, query_tokens: &[String]) -> Vec<usize> {
        let term_sets: Vec<&HashSet<usize>> =
            query_tokens.iter().filter_map(|t| self.term_index.get(t)).collect();
        let symbol_sets: Vec<&HashSet<usize>> =
            query_tokens.iter().filter_map(|t| self.symbol_index.get(t)).collect();

        // A token with no postings anywhere makes the strict intersection empty.
        let term_intersection = if term_sets.len() == query_tokens.len() {
            intersect_postings(&term_sets)
        } else {
            HashSet::new()
        };
        let symbol_intersection = if !symbol_sets.is_empty() && symbol_sets.len() == query_tokens.len()
        {
            intersect_postings(&symbol_sets)
        } else {
            HashSet::new()
        };

        let mut result: HashSet<usize> = term_intersection.clone();
        result.extend(&symbol_intersection);

        // Precision starved: widen with a bounded slice of the term-posting union.
        if term_intersection.len() < INTERSECTION_RECALL_FLOOR {
            let mut union: Vec<usize> = term_sets.iter().flat_map(|s| s.iter().copied()).collect();
            union.sort_unstable();
            union.dedup();
            let mut added = 0usize;
            for index in union {
                if result.insert(index) {
                    added += 1;
                    if added >= UNION_AUGMENT_CAP {
                        break;
                    }
                }
            }
        }

        let mut out: Vec<usize> = result.into_iter().collect();
        out.sort_unstable();
        out
    }

    // -----------------------------------------------------------------------
    // Validation (exposed for tests)
    // -----------------------------------------------------------------------

    /// Walk every posting map and confirm each index points at a live entry
    /// that still carries the key it was indexed under.
    pub fn validate(&self) -> Result<(), String> {
        let live = |i: usize| self.entry(i).is_some();
        for (term, postings) in &self.term_index {
            for &i in postings {
                let entry = self.entry(i).ok_or_else(|| format!("term '{term}' -> dead {i}"))?;
                let has = entry.snippet_tokens.contains(term)
                    || entry.uri_tokens.contains(term)
                    || entry.symbol_tokens.contains(term);
                if !has {
                    return Err(format!("term '{term}' not in entry {i} token sets"));
                }
            }
            if postings.is_empty() {
                return Err(format!("empty posting set for term '{term}'"));
            }
        }
        for (symbol, postings) in &self.symbol_index {
            for &i in postings {
                let entry = self.entry(i).ok_or_else(|| format!("symbol '{symbol}' -> dead {i}"))?;
                if !entry.symbols.iter().any(|s| s.to_lowercase() == *symbol) {
                    return Err(format!("symbol '{symbol}' not declared by entry {i}"));
                }
            }
            if postings.is_empty() {
                return Err(format!("empty posting set for symbol '{symbol}'"));
            }
        }
        for (key, postings) in
            self.language_index.iter().chain(self.path_hierarchy_index.iter())
        {
            if postings.is_empty() {
                return Err(format!("empty posting set for '{key}'"));
            }
            if let Some(&dead) = postings.iter().find(|&&i| !live(i)) {
                return Err(format!("'{key}' -> dead {dead}"));
            }
        }
        for (canon, &i) in &self.path_index {
            let entry = self.entry(i).ok_or_else(|| format!("path '{canon}' -> dead {i}"))?;
            if canon_uri(&entry.uri) != *canon {
                return Err(format!("path index key '{canon}' does not match entry {i}"));
            }
        }
        Ok(())
    }

    /// True when every posting map (including the path index) is empty.
    pub fn postings_empty(&self) -> bool {
        self.term_index.is_empty()
            && self.symbol_index.is_empty()
            && self.language_index.is_empty()
            && self.path_hierarchy_index.is_empty()
            && self.symbol_relationship_index.is_empty()
            && self.path_index.is_empty()
    }
}

fn remove_posting(map: &mut HashMap<String, HashSet<usize>>, key: &str, index: usize) {
    if let Some(postings) = map.get_mut(key) {
        postings.remove(&index);
        if postings.is_empty() {
            map.remove(key);
        }
    }
}

// ---------------------------------------------------------------------------
// Posting-set intersection
// ---------------------------------------------------------------------------

/// Intersect posting sets, smallest first, early-exiting once empty. Small
/// inputs use hash membership; large ones are sorted and merge-intersected.
fn intersect_postings(sets: &[&HashSet<usize>]) -> HashSet<usize> {
    if sets.is_empty() {
        return HashSet::new();
    }
    let mut ordered: Vec<&HashSet<usize>> = sets.to_vec();
    ordered.sort_by_key(|s| s.len());
    if ordered[0].is_empty() {
        return HashSet::new();
    }

    if ordered[0].len() <= MERGE_INTERSECT_THRESHOLD {
        let mut result: HashSet<usize> = ordered[0].clone();
        for set in &ordered[1..] {
            result.retain(|i| set.contains(i));
            if result.is_empty() {
                break;
            }
        }
        result
    } else {
        let mut sorted: Vec<Vec<usize>> = ordered
            .iter()
            .map(|s| {
                let mut v: Vec<usize> = s.iter().copied().collect();
                v.sort_unstable();
                v
            })
            .collect();
        let mut result = sorted.remove(0);
        for other in &sorted {
            result = merge_intersect(&result, other);
            if result.is_empty() {
                break;
            }
        }
        result.into_iter().collect()
    }
}

/// Linear merge of two sorted index lists.
fn merge_intersect(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
