//! Query front-end: result/embedding caches, the candidate scoring loop with
//! its three guardrails (wall-clock deadline, lazy chunk evaluation, early
//! termination), hybrid reranking, and the fallback path used whenever scoring
//! is unavailable.

use crate::embed;
use crate::score::{self, ScoredCandidate, SemanticInputs};
use crate::services::Collaborators;
use crate::stats::Bm25Stats;
use crate::store::IndexStore;
use crate::types::{
    estimate_tokens, QueryMetrics, QueryOutcome, VectorStoreKind, EARLY_TERMINATION_COUNT,
    EARLY_TERMINATION_SCORE, EMBEDDING_CACHE_CAPACITY, LAZY_CHUNK_MIN_SCORE,
    RESULT_CACHE_CAPACITY,
};
use coderag_core::{TimedLru, TokenCache};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Deadline checks happen once per this many scored candidates.
const DEADLINE_CHECK_INTERVAL: usize = 16;

/// Hard cap on the rerank pool, on top of the 3·k rule.
const RERANK_POOL_CAP: usize = 50;

/// Queries matching one of these exact keywords start from a precomputed pool.
pub const COMMON_QUERY_KEYWORDS: &[&str] = &[
    "function", "class", "interface", "struct", "import", "export", "test", "config", "error",
    "async",
];

/// Size cap of each precomputed common-query pool.
const COMMON_POOL_CAP: usize = 100;

// ---------------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------------

/// A cached, fully formatted query answer.
#[derive(Clone)]
pub struct CachedQueryResult {
    pub results: Vec<String>,
    pub metrics: QueryMetrics,
}

/// The two per-query caches, bounded and TTL-expired.
pub struct QueryCaches {
    pub results: TimedLru<String, CachedQueryResult>,
    pub embeddings: TimedLru<String, Vec<f32>>,
}

impl QueryCaches {
    pub fn new(result_ttl_ms: u64) -> Self {
        let ttl = Duration::from_millis(result_ttl_ms.max(1));
        Self {
            results: TimedLru::new(RESULT_CACHE_CAPACITY, ttl),
            embeddings: TimedLru::new(EMBEDDING_CACHE_CAPACITY, Duration::from_secs(600)),
        }
    }

    pub fn clear(&mut self) {
        self.results.clear();
        self.embeddings.clear();
    }

    /// Halve capacities under soft memory pressure.
    pub fn shrink(&mut self) {
        self.results.shrink_to(RESULT_CACHE_CAPACITY / 2);
        self.embeddings.shrink_to(EMBEDDING_CACHE_CAPACITY / 2);
    }
}

/// Precompute warm candidate pools for the common query keywords.
pub fn rebuild_common_pools(store: &IndexStore) -> HashMap<String, Vec<usize>> {
    let mut pools = HashMap::new();
    for keyword in COMMON_QUERY_KEYWORDS {
        if let Some(postings) = store.term_postings(keyword) {
            let mut pool: Vec<usize> = postings.iter().copied().collect();
            pool.sort_unstable();
            pool.truncate(COMMON_POOL_CAP);
            pools.insert((*keyword).to_string(), pool);
        }
    }
    pools
}

// ---------------------------------------------------------------------------
// Query execution
// ---------------------------------------------------------------------------

/// Everything a single query needs, borrowed from the engine state.
pub struct QueryContext<'a> {
    pub store: &'a IndexStore,
    pub stats: &'a mut Bm25Stats,
    pub caches: &'a mut QueryCaches,
    pub common_pools: &'a HashMap<String, Vec<usize>>,
    pub collab: &'a Collaborators,
    pub token_cache: &'a TokenCache,
    pub timeout: Duration,
    pub vector_store_kind: VectorStoreKind,
    pub scoring_disabled: bool,
}

/// Run one query end to end. Never fails: the worst outcome is an empty result
/// list with metrics.
pub fn run_query(ctx: &mut QueryContext, raw_query: &str, k: usize) -> QueryOutcome {
    let started = Instant::now();
    let canon = raw_query.trim().to_lowercase();
    let cache_key = format!("{canon}:{k}");

    if let Some(hit) = ctx.caches.results.get(&cache_key) {
        let mut outcome = QueryOutcome { results: hit.results.clone(), metrics: hit.metrics.clone() };
        outcome.metrics.retrieval_latency_ms = started.elapsed().as_millis() as u64;
        return outcome;
    }

    if k == 0 {
        return QueryOutcome::default();
    }

    let query_tokens_set = ctx.token_cache.tokens(&canon);
    let mut query_tokens: Vec<String> = query_tokens_set.iter().cloned().collect();
    query_tokens.sort_unstable();

    if ctx.scoring_disabled {
        let outcome = fallback_outcome(ctx, &query_tokens_set, k, started, QueryMetrics::default());
        remember(ctx, cache_key, &outcome);
        return outcome;
    }

    // Query embedding, through its cache.
    let mut embedding_latency_ms = None;
    let query_embedding: Option<Vec<f32>> = if embed::embedding_usable(ctx.collab) {
        match ctx.caches.embeddings.get(&canon) {
            Some(cached) => Some(cached.clone()),
            None => {
                let embed_started = Instant::now();
                let computed =
                    embed::embed_query(&canon, ctx.collab, &crate::types::CancelToken::new());
                embedding_latency_ms = Some(embed_started.elapsed().as_millis() as u64);
                if let Some(vector) = &computed {
                    ctx.caches.embeddings.put(canon.clone(), vector.clone());
                }
                computed
            }
        }
    } else {
        None
    };

    // External vector store: fan out in parallel with the scoring loop.
    let vector_handle = spawn_vector_query(ctx, query_embedding.as_deref(), k);

    // Candidate selection, warm-started from a precomputed pool when possible.
    let mut candidates: Vec<usize> = match ctx.common_pools.get(&canon) {
        Some(pool) => pool.clone(),
        None => ctx.store.candidates(&query_tokens),
    };
    // A query that is itself an indexed path hits that entry directly.
    if let Some(exact) = ctx.store.index_of(&canon) {
        if !candidates.contains(&exact) {
            candidates.insert(0, exact);
        }
    }

    // Scoring loop.
    let deadline = started + ctx.timeout;
    let avg_doc_length = ctx.stats.avg_doc_length();
    let doc_freqs = score::candidate_doc_freqs(&query_tokens, &candidates, ctx.stats);
    let population = candidates.len();

    let mut scored: Vec<ScoredCandidate> = Vec::with_capacity(candidates.len());
    let mut order = 0usize;
    let mut strong = 0usize;
    let mut timed_out = false;
    let mut early_terminated = false;

    for (seen, &entry_index) in candidates.iter().enumerate() {
        if seen % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() > deadline {
            timed_out = true;
            break;
        }
        let Some(entry) = ctx.store.entry(entry_index) else {
            continue;
        };

        let base = score::base_score(entry, &query_tokens_set, &canon);
        let bm25_component = match ctx.stats.doc(entry_index) {
            Some(doc) => {
                score::bm25_score(doc, &query_tokens, &doc_freqs, population, avg_doc_length)
            }
            None => 0.0,
        };
        let entry_score = score::blend(base, bm25_component);

        scored.push(ScoredCandidate {
            entry_index,
            chunk_index: None,
            score: entry_score,
            order,
        });
        order += 1;
        if entry_score >= EARLY_TERMINATION_SCORE {
            strong += 1;
        }

        // Lazy chunk evaluation: chunks only matter once the snippet shows
        // promise.
        if entry_score >= LAZY_CHUNK_MIN_SCORE {
            for (chunk_index, chunk) in entry.chunks.iter().enumerate() {
                let chunk_points = score::chunk_score(chunk, &query_tokens_set, &canon);
                if chunk_points <= 0.0 {
                    continue;
                }
                scored.push(ScoredCandidate {
                    entry_index,
                    chunk_index: Some(chunk_index),
                    score: chunk_points,
                    order,
                });
                order += 1;
                if chunk_points >= EARLY_TERMINATION_SCORE {
                    strong += 1;
                }
            }
        }

        if strong >= EARLY_TERMINATION_COUNT {
            early_terminated = true;
            break;
        }
    }

    // Deadline expired before anything was scored: fall back.
    if timed_out && scored.is_empty() {
        let seed = QueryMetrics { timed_out: true, ..Default::default() };
        let outcome = fallback_outcome(ctx, &query_tokens_set, k, started, seed);
        remember(ctx, cache_key, &outcome);
        return outcome;
    }

    // Rerank pool: top 3·k, capped.
    let pool_size = (3 * k).clamp(k, RERANK_POOL_CAP);
    let mut pool = score::top_k(scored, pool_size);

    // Hybrid pass over the head of the pool.
    let vector_scores = join_vector_query(vector_handle);
    let mut hybrid_used = None;
    if let Some(query_embedding) = &query_embedding {
        let head = ((3 * k) / 2).max(k).min(pool.len());
        let inputs = SemanticInputs {
            query_embedding,
            vector_scores: vector_scores.as_ref(),
        };
        score::hybrid_rerank(&mut pool[..head], ctx.store, &inputs);
        pool[..head].sort_by(|a, b| {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
        });
        hybrid_used = Some(true);
    }

    // A whole-file result still cites its best-scoring chunk, so the caller
    // gets the precise line range rather than the file head.
    let mut best_chunk: HashMap<usize, (usize, f32)> = HashMap::new();
    for candidate in &pool {
        if let Some(chunk_index) = candidate.chunk_index {
            let slot = best_chunk.entry(candidate.entry_index).or_insert((chunk_index, f32::MIN));
            if candidate.score > slot.1 {
                *slot = (chunk_index, candidate.score);
            }
        }
    }

    // Dedup by file, keep the k best, drop zero-scored leftovers.
    let deduped = score::dedup_by_uri(pool, ctx.store);
    let finalists: Vec<ScoredCandidate> =
        deduped.into_iter().filter(|c| c.score > 0.0).take(k).collect();

    let top_score = finalists.first().map(|c| c.score).unwrap_or(0.0);
    let results: Vec<String> = finalists
        .iter()
        .filter_map(|c| {
            let cite = c
                .chunk_index
                .or_else(|| best_chunk.get(&c.entry_index).map(|(chunk_index, _)| *chunk_index));
            ctx.store
                .entry(c.entry_index)
                .map(|entry| score::format_result(entry, cite, &query_tokens_set))
        })
        .collect();

    let metrics = QueryMetrics {
        retrieval_latency_ms: started.elapsed().as_millis() as u64,
        tokens_injected: results.iter().map(|r| estimate_tokens(r)).sum(),
        results_count: results.len(),
        top_score,
        timed_out,
        early_terminated,
        embedding_latency_ms,
        hybrid_search_used: hybrid_used,
    };

    let outcome = QueryOutcome { results, metrics };
    remember(ctx, cache_key, &outcome);
    outcome
}

fn remember(ctx: &mut QueryContext, cache_key: String, outcome: &QueryOutcome) {
    ctx.caches.results.put(
        cache_key,
        CachedQueryResult { results: outcome.results.clone(), metrics: outcome.metrics.clone() },
    );
}

// ---------------------------------------------------------------------------
// Vector-store fan-out
// ---------------------------------------------------------------------------

type VectorJoinHandle = std::thread::JoinHandle<Option<Vec<crate::services::VectorHit>>>;

fn spawn_vector_query(
    ctx: &QueryContext,
    query_embedding: Option<&[f32]>,
    k: usize,
) -> Option<VectorJoinHandle> {
    if ctx.vector_store_kind != VectorStoreKind::External {
        return None;
    }
    let service = ctx.collab.vectors.as_ref()?;
    if !service.is_enabled() {
        return None;
    }
    let embedding = query_embedding?.to_vec();
    let service = Arc::clone(service);
    let want = 2 * k;
    Some(std::thread::spawn(move || match service.query(&embedding, want) {
        Ok(hits) => Some(hits),
        Err(e) => {
            debug!(error = %e, "Vector store query failed");
            None
        }
    }))
}

fn join_vector_query(handle: Option<VectorJoinHandle>) -> Option<HashMap<String, f32>> {
    let hits = handle?.join().ok()??;
    Some(hits.into_iter().map(|hit| (hit.id, hit.score)).collect())
}

// ---------------------------------------------------------------------------
// Fallback path
// ---------------------------------------------------------------------------

/// Scoring-free answer used when the engine is self-disabled or a deadline
/// expired before any candidate was scored: entries whose URI tokens overlap
/// the query, snippet-only, in index order.
pub fn fallback_results(
    store: &IndexStore,
    query_tokens: &HashSet<String>,
    k: usize,
) -> Vec<(usize, f32)> {
    let mut out = Vec::new();
    for (index, entry) in store.iter() {
        let overlap = entry.uri_tokens.intersection(query_tokens).count();
        if overlap > 0 {
            out.push((index, overlap as f32));
            if out.len() >= k {
                break;
            }
        }
    }
    out
}

fn fallback_outcome(
    ctx: &QueryContext,
    query_tokens: &HashSet<String>,
    k: usize,
    started: Instant,
    seed: QueryMetrics,
) -> QueryOutcome {
    let hits = fallback_results(ctx.store, query_tokens, k);
    let results: Vec<String> = hits
        .iter()
        .filter_map(|(index, _)| {
            ctx.store.entry(*index).map(|entry| score::format_result(entry, None, query_tokens))
        })
        .collect();
    let top_score = hits.first().map(|(_, s)| *s).unwrap_or(0.0);
    let metrics = QueryMetrics {
        retrieval_latency_ms: started.elapsed().as_millis() as u64,
        tokens_injected: results.iter().map(|r| estimate_tokens(r)).sum(),
        results_count: results.len(),
        top_score,
        ..seed
    };
    QueryOutcome { results, metrics }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
