//! Embedding integration: privacy gate, secret redaction, batched vector
//! computation for snippets, chunks, and query text.
//!
//! Embedding is strictly optional. Every path here degrades to "no vectors";
//! a collaborator failure is logged at debug and never surfaces.

use crate::services::Collaborators;
use crate::types::{CancelToken, IndexEntry};
use tracing::debug;

/// True when embeddings may be computed right now: a service is wired in,
/// reports itself enabled, and the privacy gate does not forbid it.
pub fn embedding_usable(collab: &Collaborators) -> bool {
    let enabled = collab.embeddings.as_ref().map(|e| e.is_enabled()).unwrap_or(false);
    if !enabled {
        return false;
    }
    match &collab.privacy {
        Some(gate) => !gate.is_offline_or_privacy_mode(),
        None => true,
    }
}

/// Run `text` through secret detection, returning the redacted form when the
/// service is present and enabled.
pub fn redact(text: &str, collab: &Collaborators) -> String {
    match &collab.secrets {
        Some(service) if service.is_enabled() => {
            let scan = service.detect_secrets(text);
            if scan.has_secrets {
                scan.redacted_text
            } else {
                text.to_string()
            }
        }
        _ => text.to_string(),
    }
}

/// Normalize a batch response: one vector per text is taken as-is; a single
/// flat vector for a multi-text batch is split into equal slices.
fn normalize_batch(mut vectors: Vec<Vec<f32>>, expected: usize) -> Option<Vec<Vec<f32>>> {
    if vectors.len() == expected {
        return Some(vectors);
    }
    if vectors.len() == 1 && expected > 1 {
        let flat = vectors.remove(0);
        if !flat.is_empty() && flat.len() % expected == 0 {
            let dim = flat.len() / expected;
            return Some(flat.chunks(dim).map(|c| c.to_vec()).collect());
        }
    }
    None
}

/// Compute and attach snippet and chunk embeddings in one batched call.
/// `entry.chunks[i].embedding` stays aligned with `entry.chunks[i]`.
pub fn embed_entry(entry: &mut IndexEntry, collab: &Collaborators, cancel: &CancelToken) {
    if !embedding_usable(collab) || cancel.is_cancelled() {
        return;
    }
    let Some(service) = &collab.embeddings else {
        return;
    };

    let mut texts = Vec::with_capacity(1 + entry.chunks.len());
    texts.push(redact(&entry.snippet, collab));
    for chunk in &entry.chunks {
        texts.push(redact(&chunk.text, collab));
    }

    let vectors = match service.embed(&texts, cancel) {
        Ok(vectors) => vectors,
        Err(e) => {
            debug!(uri = entry.uri.as_str(), error = %e, "Embedding failed, indexing without vectors");
            return;
        }
    };
    let Some(mut vectors) = normalize_batch(vectors, texts.len()) else {
        debug!(uri = entry.uri.as_str(), "Embedding batch shape mismatch, ignoring vectors");
        return;
    };

    let chunk_vectors = vectors.split_off(1);
    if let Some(snippet_vector) = vectors.pop() {
        if !snippet_vector.is_empty() {
            entry.snippet_embedding = Some(snippet_vector);
        }
    }
    for (chunk, vector) in entry.chunks.iter_mut().zip(chunk_vectors) {
        if !vector.is_empty() {
            chunk.embedding = Some(vector);
        }
    }
}

/// Embed a query string. Returns `None` whenever embedding is unusable or the
/// collaborator fails.
pub fn embed_query(text: &str, collab: &Collaborators, cancel: &CancelToken) -> Option<Vec<f32>> {
    if !embedding_usable(collab) {
        return None;
    }
    let service = collab.embeddings.as_ref()?;
    let redacted = redact(text, collab);
    match service.embed(&[redacted], cancel) {
        Ok(vectors) => {
            let normalized = normalize_batch(vectors, 1)?;
            normalized.into_iter().next().filter(|v| !v.is_empty())
        }
        Err(e) => {
            debug!(error = %e, "Query embedding failed");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        EmbeddingService, PrivacyGate, SecretDetectionService, SecretScan,
    };
    use crate::types::Chunk;
    use std::sync::Arc;

    struct FixedEmbedder {
        dim: usize,
        flat: bool,
    }

    impl EmbeddingService for FixedEmbedder {
        fn is_enabled(&self) -> bool {
            true
        }
        fn embed(&self, texts: &[String], _cancel: &CancelToken) -> Result<Vec<Vec<f32>>, String> {
            if self.flat {
                Ok(vec![vec![0.5; self.dim * texts.len()]])
            } else {
                Ok(texts.iter().map(|t| vec![t.len() as f32; self.dim]).collect())
            }
        }
    }

    struct OfflineGate;
    impl PrivacyGate for OfflineGate {
        fn is_offline_or_privacy_mode(&self) -> bool {
            true
        }
    }

    struct TokenRedactor;
    impl SecretDetectionService for TokenRedactor {
        fn is_enabled(&self) -> bool {
            true
        }
        fn detect_secrets(&self, text: &str) -> SecretScan {
            let has = text.contains("SECRET");
            SecretScan {
                has_secrets: has,
                redacted_text: text.replace("SECRET", "[redacted]"),
            }
        }
    }

    fn entry_with_chunks(n: usize) -> IndexEntry {
        IndexEntry {
            uri: "a.ts".to_string(),
            snippet: "snippet text".to_string(),
            chunks: (0..n)
                .map(|i| Chunk {
                    text: format!("chunk {i}"),
                    start_line: i + 1,
                    end_line: i + 1,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_privacy_gate_blocks_embedding() {
        let collab = Collaborators {
            embeddings: Some(Arc::new(FixedEmbedder { dim: 4, flat: false })),
            privacy: Some(Arc::new(OfflineGate)),
            ..Default::default()
        };
        assert!(!embedding_usable(&collab));
        let mut entry = entry_with_chunks(2);
        embed_entry(&mut entry, &collab, &CancelToken::new());
        assert!(entry.snippet_embedding.is_none());
    }

    #[test]
    fn test_embed_entry_aligns_chunk_vectors() {
        let collab = Collaborators {
            embeddings: Some(Arc::new(FixedEmbedder { dim: 4, flat: false })),
            ..Default::default()
        };
        let mut entry = entry_with_chunks(3);
        embed_entry(&mut entry, &collab, &CancelToken::new());
        assert!(entry.snippet_embedding.is_some());
        for chunk in &entry.chunks {
            assert_eq!(chunk.embedding.as_ref().map(|v| v.len()), Some(4));
        }
    }

    #[test]
    fn test_flat_batch_is_split() {
        let collab = Collaborators {
            embeddings: Some(Arc::new(FixedEmbedder { dim: 4, flat: true })),
            ..Default::default()
        };
        let mut entry = entry_with_chunks(2);
        embed_entry(&mut entry, &collab, &CancelToken::new());
        assert_eq!(entry.snippet_embedding.as_ref().map(|v| v.len()), Some(4));
        assert_eq!(entry.chunks[1].embedding.as_ref().map(|v| v.len()), Some(4));
    }

    #[test]
    fn test_redaction_applied_before_embedding() {
        let collab = Collaborators {
            secrets: Some(Arc::new(TokenRedactor)),
            ..Default::default()
        };
        assert_eq!(redact("key=SECRET", &collab), "key=[redacted]");
        assert_eq!(redact("clean", &collab), "clean");
    }

    #[test]
    fn test_embed_query() {
        let collab = Collaborators {
            embeddings: Some(Arc::new(FixedEmbedder { dim: 3, flat: false })),
            ..Default::default()
        };
        let vector = embed_query("find parser", &collab, &CancelToken::new());
        assert_eq!(vector.map(|v| v.len()), Some(3));
        assert!(embed_query("q", &Collaborators::default(), &CancelToken::new()).is_none());
    }
}
