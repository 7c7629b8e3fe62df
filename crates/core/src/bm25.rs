//! BM25 term scoring, cosine similarity, and score normalization.
//!
//! Classical BM25 with k1/b defaults; IDF is computed over whichever document
//! population the caller passes in (the engine uses the candidate set, not the
//! whole corpus, so scoring stays bounded per query).

/// Term-frequency saturation.
pub const K1: f32 = 1.2;
/// Document-length normalization.
pub const B: f32 = 0.75;

/// Scores closer than this are treated as a tie by top-k selection.
pub const TIE_EPSILON: f32 = 0.1;

/// Smoothed IDF over a document population of size `population`.
/// Clamped non-negative so very common terms contribute zero, not negative.
pub fn idf(doc_freq: usize, population: usize) -> f32 {
    let n = population as f32;
    let df = doc_freq as f32;
    (((n - df + 0.5) / (df + 0.5)) + 1.0).ln().max(0.0)
}

/// BM25 contribution of a single term.
pub fn term_score(term_freq: usize, doc_length: usize, avg_doc_length: f32, idf: f32) -> f32 {
    if term_freq == 0 {
        return 0.0;
    }
    let tf = term_freq as f32;
    let dl = doc_length as f32;
    let avgdl = avg_doc_length.max(1.0);
    let denom = tf + K1 * (1.0 - B + B * dl / avgdl);
    idf * (tf * (K1 + 1.0)) / denom.max(f32::EPSILON)
}

/// Cosine similarity of two vectors. Mismatched or zero-length inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Min-max normalize `scores` into [0, 1]. A degenerate range (all scores
/// identical, or an empty slice) maps every score to 0.5.
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    let Some(&first) = scores.first() else {
        return Vec::new();
    };
    let mut min = first;
    let mut max = first;
    for &s in scores {
        min = min.min(s);
        max = max.max(s);
    }
    let range = max - min;
    if range <= f32::EPSILON {
        return vec![0.5; scores.len()];
    }
    scores.iter().map(|&s| (s - min) / range).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
