//! Ranking: the heuristic base score, the BM25 blend, hybrid reranking over
//! embeddings or an external vector store, heap-based top-k selection, per-file
//! deduplication, and result-block formatting.

use crate::stats::DocStats;
use crate::store::IndexStore;
use crate::types::{Chunk, IndexEntry};
use coderag_core::bm25;
use coderag_core::bm25::TIE_EPSILON;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Weight of the BM25 term contribution against the heuristic base score.
pub const BM25_BLEND_WEIGHT: f32 = 0.3;

/// Hybrid blend weights: normalized lexical score vs cosine similarity.
pub const HYBRID_LEXICAL_WEIGHT: f32 = 0.6;
pub const HYBRID_SEMANTIC_WEIGHT: f32 = 0.4;

// Base-score contributions.
const EXACT_SYMBOL_BONUS: f32 = 10.0;
const PARTIAL_SYMBOL_BONUS: f32 = 4.0;
const SYMBOL_TOKEN_BONUS: f32 = 2.0;
const URI_TOKEN_BONUS: f32 = 3.0;
const SNIPPET_OVERLAP_WEIGHT: f32 = 1.5;
const SNIPPET_OVERLAP_CAP: f32 = 5.0;
const PHRASE_BONUS: f32 = 1.0;

// Chunk-score contributions.
const CHUNK_PHRASE_BONUS: f32 = 5.0;
const CHUNK_TOKEN_WEIGHT: f32 = 2.0;

/// One scored candidate: a whole entry (snippet) or one of its chunks.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub entry_index: usize,
    /// `None` scores the entry's snippet; `Some(i)` scores `chunks[i]`.
    pub chunk_index: Option<usize>,
    pub score: f32,
    /// Insertion order, used to keep ties stable.
    pub order: usize,
}

// ---------------------------------------------------------------------------
// Heuristic base score
// ---------------------------------------------------------------------------

/// Fast entry-level score over the pre-computed token sets.
pub fn base_score(entry: &IndexEntry, query_tokens: &HashSet<String>, phrase: &str) -> f32 {
    let mut score = 0.0f32;

    // Symbol signals: exact name match dominates, then partial, then overlap.
    let mut exact = false;
    let mut partial = false;
    if !phrase.is_empty() {
        for symbol in &entry.symbols {
            let lower = symbol.to_lowercase();
            if lower == phrase {
                exact = true;
                break;
            }
            if !partial && (lower.contains(phrase) || phrase.contains(lower.as_str())) {
                partial = true;
            }
        }
    }
    if exact {
        score += EXACT_SYMBOL_BONUS;
    } else if partial {
        score += PARTIAL_SYMBOL_BONUS;
    }
    let symbol_overlap = entry.symbol_tokens.intersection(query_tokens).count();
    score += SYMBOL_TOKEN_BONUS * symbol_overlap as f32;

    if query_tokens.iter().any(|t| entry.uri_tokens.contains(t)) {
        score += URI_TOKEN_BONUS;
    }

    let snippet_overlap = entry.snippet_tokens.intersection(query_tokens).count();
    score += (SNIPPET_OVERLAP_WEIGHT * snippet_overlap as f32).min(SNIPPET_OVERLAP_CAP);

    if !phrase.is_empty() && entry.snippet.to_lowercase().contains(phrase) {
        score += PHRASE_BONUS;
    }

    score
}

/// Chunk-level score with a mild bias toward shorter chunks.
pub fn chunk_score(chunk: &Chunk, query_tokens: &HashSet<String>, phrase: &str) -> f32 {
    let mut score = 0.0f32;
    if !phrase.is_empty() && chunk.text.to_lowercase().contains(phrase) {
        score += CHUNK_PHRASE_BONUS;
    }
    let overlap = chunk.tokens.intersection(query_tokens).count();
    score += CHUNK_TOKEN_WEIGHT * overlap as f32;

    let length_factor = 1.0 + 0.1 * (1.0 - (chunk.text.len() as f32 / 600.0).min(1.0));
    score * length_factor
}

// ---------------------------------------------------------------------------
// BM25 blend
// ---------------------------------------------------------------------------

/// Per-token document frequencies over the candidate population. Computed once
/// per query so IDF stays bounded by the candidate set, not the corpus.
pub fn candidate_doc_freqs<'a>(
    tokens: &'a [String],
    candidates: &[usize],
    stats: &crate::stats::Bm25Stats,
) -> HashMap<&'a str, usize> {
    tokens.iter().map(|t| (t.as_str(), stats.doc_freq_among(t, candidates))).collect()
}

/// BM25 score of one document against the query tokens.
pub fn bm25_score(
    doc: &DocStats,
    tokens: &[String],
    doc_freqs: &HashMap<&str, usize>,
    population: usize,
    avg_doc_length: f32,
) -> f32 {
    let mut total = 0.0f32;
    for token in tokens {
        let tf = doc.term_frequencies.get(token).copied().unwrap_or(0);
        if tf == 0 {
            continue;
        }
        let df = doc_freqs.get(token.as_str()).copied().unwrap_or(0);
        let idf = bm25::idf(df, population);
        total += bm25::term_score(tf, doc.doc_length, avg_doc_length, idf);
    }
    total
}

/// Blend the heuristic base with the BM25 contribution.
pub fn blend(base: f32, bm25_component: f32) -> f32 {
    base + BM25_BLEND_WEIGHT * bm25_component
}

// ---------------------------------------------------------------------------
// Hybrid reranking
// ---------------------------------------------------------------------------

/// Semantic inputs for the hybrid pass: the query embedding, plus vector-store
/// scores by document id when an external store answered.
pub struct SemanticInputs<'a> {
    pub query_embedding: &'a [f32],
    pub vector_scores: Option<&'a HashMap<String, f32>>,
}

/// Document id convention shared with external vector stores.
pub fn doc_id(uri: &str, chunk_index: Option<usize>) -> String {
    match chunk_index {
        Some(i) => format!("{uri}:{i}"),
        None => uri.to_string(),
    }
}

/// Rerank `list` in place: min-max-normalize the lexical scores, blend with
/// cosine similarity (or the external store's score when it covered the
/// document), and overwrite each candidate's score. Missing embeddings
/// contribute 0.
pub fn hybrid_rerank(list: &mut [ScoredCandidate], store: &IndexStore, inputs: &SemanticInputs) {
    if list.is_empty() {
        return;
    }
    let lexical: Vec<f32> = list.iter().map(|c| c.score).collect();
    let normalized = bm25::normalize_scores(&lexical);

    for (candidate, lexical_norm) in list.iter_mut().zip(normalized) {
        let semantic = semantic_score(candidate, store, inputs);
        candidate.score =
            HYBRID_LEXICAL_WEIGHT * lexical_norm + HYBRID_SEMANTIC_WEIGHT * semantic;
    }
}

fn semantic_score(candidate: &ScoredCandidate, store: &IndexStore, inputs: &SemanticInputs) -> f32 {
    let Some(entry) = store.entry(candidate.entry_index) else {
        return 0.0;
    };
    if let Some(scores) = inputs.vector_scores {
        if let Some(&external) = scores.get(&doc_id(&entry.uri, candidate.chunk_index)) {
            return external;
        }
    }
    let embedding = match candidate.chunk_index {
        Some(i) => entry.chunk_embedding(i),
        None => entry.snippet_embedding.as_deref(),
    };
    match embedding {
        Some(vector) => bm25::cosine_similarity(inputs.query_embedding, vector),
        None => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Top-k selection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
struct HeapKey {
    score: f32,
    order: usize,
}

impl Eq for HeapKey {}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Near-equal scores tie; earlier insertion ranks higher.
        if (self.score - other.score).abs() < TIE_EPSILON {
            other.order.cmp(&self.order)
        } else {
            self.score.partial_cmp(&other.score).unwrap_or(std::cmp::Ordering::Equal)
        }
    }
}

/// Keep the best `k` candidates using a bounded min-heap: O(n log k).
/// Returns them sorted best-first.
pub fn top_k(candidates: impl IntoIterator<Item = ScoredCandidate>, k: usize) -> Vec<ScoredCandidate> {
    if k == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<Reverse<(HeapKey, usize)>> = BinaryHeap::with_capacity(k + 1);
    let mut kept: Vec<Option<ScoredCandidate>> = Vec::new();

    for candidate in candidates {
        let key = HeapKey { score: candidate.score, order: candidate.order };
        let slot = kept.len();
        kept.push(Some(candidate));
        heap.push(Reverse((key, slot)));
        if heap.len() > k {
            if let Some(Reverse((_, evicted))) = heap.pop() {
                kept[evicted] = None;
            }
        }
    }

    let mut result: Vec<(HeapKey, ScoredCandidate)> = heap
        .into_iter()
        .filter_map(|Reverse((key, slot))| kept[slot].take().map(|c| (key, c)))
        .collect();
    result.sort_by(|(a, _), (b, _)| b.cmp(a));
    result.into_iter().map(|(_, c)| c).collect()
}

/// Deduplicate a best-first list by file, keeping the top-scoring item per URI.
pub fn dedup_by_uri(candidates: Vec<ScoredCandidate>, store: &IndexStore) -> Vec<ScoredCandidate> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let Some(entry) = store.entry(candidate.entry_index) else {
            continue;
        };
        if seen.insert(crate::types::canon_uri(&entry.uri)) {
            out.push(candidate);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Render one result as the human-readable block injected into prompts:
/// a `File:` header with the line range, an optional `Symbols:` line with
/// query-matching names pulled to the front, and the cited text.
pub fn format_result(
    entry: &IndexEntry,
    chunk_index: Option<usize>,
    query_tokens: &HashSet<String>,
) -> String {
    let (text, start_line, end_line) = match chunk_index.and_then(|i| entry.chunks.get(i)) {
        Some(chunk) => (chunk.text.as_str(), chunk.start_line, chunk.end_line),
        None => (entry.snippet.as_str(), entry.snippet_start_line.max(1), entry.snippet_end_line),
    };

    let mut block = String::with_capacity(text.len() + entry.uri.len() + 64);
    block.push_str("File: ");
    block.push_str(&entry.uri);
    if end_line > start_line {
        block.push_str(&format!(":{start_line}-{end_line}"));
    } else {
        block.push_str(&format!(":{start_line}"));
    }
    block.push('\n');

    let symbols = select_symbols(entry, query_tokens);
    if !symbols.is_empty() {
        block.push_str("Symbols: ");
        block.push_str(&symbols.join(", "));
        block.push('\n');
    }

    block.push_str(text);
    block
}

/// Up to five query-matching symbols, then up to five more.
fn select_symbols<'a>(entry: &'a IndexEntry, query_tokens: &HashSet<String>) -> Vec<&'a str> {
    let matches_query = |symbol: &str| {
        coderag_core::tokenize(symbol).iter().any(|t| query_tokens.contains(t))
    };
    let mut selected: Vec<&str> = Vec::new();
    for symbol in entry.symbols.iter().filter(|s| matches_query(s)).take(5) {
        selected.push(symbol);
    }
    for symbol in entry.symbols.iter().filter(|s| !matches_query(s)).take(5) {
        selected.push(symbol);
    }
    selected
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use coderag_core::tokenize;

    fn entry(uri: &str, snippet: &str, symbols: &[&str]) -> IndexEntry {
        let mut e = IndexEntry {
            uri: uri.to_string(),
            snippet: snippet.to_string(),
            snippet_start_line: 1,
            snippet_end_line: snippet.lines().count().max(1),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        e.rebuild_token_sets();
        e
    }

    fn candidate(entry_index: usize, score: f32, order: usize) -> ScoredCandidate {
        ScoredCandidate { entry_index, chunk_index: None, score, order }
    }

    #[test]
    fn test_exact_symbol_dominates() {
        let declared = entry("a.ts", "function parseUserInput() {}", &["parseUserInput"]);
        let mentioned = entry("b.ts", "// calls parseUserInput somewhere", &[]);
        let tokens = tokenize("parseUserInput");
        let phrase = "parseuserinput";
        let a = base_score(&declared, &tokens, phrase);
        let b = base_score(&mentioned, &tokens, phrase);
        assert!(a >= 10.0, "exact symbol hit must score >= 10, got {a}");
        assert!(a > b);
    }

    #[test]
    fn test_partial_symbol_and_uri_bonus() {
        let e = entry("src/parser.ts", "misc", &["parseUserInput"]);
        let tokens = tokenize("parser");
        let score = base_score(&e, &tokens, "parser");
        // Partial symbol (+4) plus uri token (+3).
        assert!(score >= 7.0);
    }

    #[test]
    fn test_snippet_overlap_is_capped() {
        let e = entry("a.ts", "alpha beta gamma delta epsilon zeta", &[]);
        let tokens = tokenize("alpha beta gamma delta epsilon zeta");
        let score = base_score(&e, &tokens, "");
        assert!(score <= SNIPPET_OVERLAP_CAP + 0.01);
    }

    #[test]
    fn test_chunk_score_prefers_shorter() {
        let mut short = Chunk {
            text: "needle".to_string(),
            start_line: 1,
            end_line: 1,
            ..Default::default()
        };
        short.tokens = tokenize(&short.text);
        let mut long = Chunk {
            text: format!("needle {}", "padding ".repeat(120)),
            start_line: 1,
            end_line: 4,
            ..Default::default()
        };
        long.tokens = tokenize(&long.text);
        let tokens = tokenize("needle");
        assert!(chunk_score(&short, &tokens, "needle") > chunk_score(&long, &tokens, "needle"));
    }

    #[test]
    fn test_top_k_bounded_and_sorted() {
        let candidates: Vec<ScoredCandidate> =
            (0..100).map(|i| candidate(i, i as f32, i)).collect();
        let top = top_k(candidates, 5);
        assert_eq!(top.len(), 5);
        assert_eq!(top[0].entry_index, 99);
        for window in top.windows(2) {
            assert!(window[0].score >= window[1].score - TIE_EPSILON);
        }
    }

    #[test]
    fn test_top_k_ties_keep_insertion_order() {
        let candidates = vec![
            candidate(0, 5.01, 0),
            candidate(1, 5.05, 1),
            candidate(2, 5.03, 2),
        ];
        let top = top_k(candidates, 2);
        assert_eq!(top.len(), 2);
        // All scores tie within epsilon; earlier insertions win.
        assert_eq!(top[0].entry_index, 0);
        assert_eq!(top[1].entry_index, 1);
    }

    #[test]
    fn test_top_k_zero() {
        assert!(top_k(vec![candidate(0, 1.0, 0)], 0).is_empty());
    }

    #[test]
    fn test_dedup_by_uri() {
        let mut store = IndexStore::new();
        let a = store.add(entry("a.ts", "one", &[]));
        let b = store.add(entry("b.ts", "two", &[]));
        let list = vec![
            ScoredCandidate { entry_index: a, chunk_index: Some(0), score: 9.0, order: 0 },
            ScoredCandidate { entry_index: a, chunk_index: None, score: 7.0, order: 1 },
            ScoredCandidate { entry_index: b, chunk_index: None, score: 5.0, order: 2 },
        ];
        let deduped = dedup_by_uri(list, &store);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].entry_index, a);
        assert_eq!(deduped[0].chunk_index, Some(0));
    }

    #[test]
    fn test_hybrid_rerank_uses_vector_store_score() {
        let mut store = IndexStore::new();
        let mut first = entry("a.ts", "alpha", &[]);
        first.snippet_embedding = Some(vec![1.0, 0.0]);
        let a = store.add(first);
        let b = store.add(entry("b.ts", "beta", &[]));

        let mut external = HashMap::new();
        external.insert("b.ts".to_string(), 0.95f32);

        let mut list = vec![candidate(a, 8.0, 0), candidate(b, 2.0, 1)];
        let inputs = SemanticInputs {
            query_embedding: &[0.0, 1.0],
            vector_scores: Some(&external),
        };
        hybrid_rerank(&mut list, &store, &inputs);
        // a: 0.6*1.0 + 0.4*cos(orthogonal)=0.6; b: 0.6*0.0 + 0.4*0.95=0.38
        assert!((list[0].score - 0.6).abs() < 1e-3);
        assert!((list[1].score - 0.38).abs() < 1e-3);
    }

    #[test]
    fn test_hybrid_identical_lexical_falls_back_to_half() {
        let mut store = IndexStore::new();
        let a = store.add(entry("a.ts", "alpha", &[]));
        let b = store.add(entry("b.ts", "beta", &[]));
        let mut list = vec![candidate(a, 3.0, 0), candidate(b, 3.0, 1)];
        let inputs = SemanticInputs { query_embedding: &[1.0], vector_scores: None };
        hybrid_rerank(&mut list, &store, &inputs);
        for c in &list {
            assert!((c.score - 0.3).abs() < 1e-6);
        }
    }

    #[test]
    fn test_format_result_chunk_citation() {
        let mut e = entry("src/big.ts", "leading", &["processBatch", "helper"]);
        e.chunks.push(Chunk {
            text: "function processBatch() {}".to_string(),
            start_line: 700,
            end_line: 780,
            tokens: tokenize("function processBatch() {}"),
            embedding: None,
        });
        let tokens = tokenize("processBatch");
        let block = format_result(&e, Some(0), &tokens);
        assert!(block.starts_with("File: src/big.ts:700-780\n"));
        assert!(block.contains("Symbols: processBatch, helper"));
        assert!(block.ends_with("function processBatch() {}"));
    }

    #[test]
    fn test_format_result_single_line() {
        let e = entry("a.ts", "only line", &[]);
        let block = format_result(&e, None, &HashSet::new());
        assert!(block.starts_with("File: a.ts:1\n"));
    }

    #[test]
    fn test_bm25_blend_ordering() {
        let mut stats = crate::stats::Bm25Stats::new();
        stats.upsert(0, "resolve dependency resolve");
        stats.upsert(1, "resolve something else entirely unrelated");
        let tokens = vec!["resolve".to_string(), "dependency".to_string()];
        let candidates = vec![0, 1];
        let dfs = candidate_doc_freqs(&tokens, &candidates, &stats);
        let avg = stats.avg_doc_length();
        let a = bm25_score(stats.doc(0).unwrap(), &tokens, &dfs, 2, avg);
        let b = bm25_score(stats.doc(1).unwrap(), &tokens, &dfs, 2, avg);
        assert!(a > b);
        assert!(blend(1.0, a) > 1.0);
    }
}
