//! Snippet, chunk, and symbol extraction for a single file.
//!
//! The extractor prefers the AST collaborator for symbols and chunk boundaries
//! and falls back to the regex scanner plus character chunking aligned to line
//! starts. Any failure short-circuits to an empty-chunk entry; extraction never
//! propagates an error to its caller.

use crate::embed;
use crate::imports::ImportScanner;
use crate::services::Collaborators;
use crate::symbols::{flatten_symbols, SymbolScanner};
use crate::types::{
    canon_uri, uri_basename, uri_extension, CancelToken, Chunk, EngineConfig, IndexEntry,
    CHUNK_COUNT, CHUNK_OVERLAP, CHUNK_SIZE, FILE_CACHE_CAPACITY, FILE_CACHE_TTL_SECS,
    OVERVIEW_CHUNK_COUNT, OVERVIEW_CHUNK_SIZE, OVERVIEW_SNIPPET_BUDGET, SNIPPET_BUDGET,
};
use coderag_core::tokenize;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

// ---------------------------------------------------------------------------
// Overview documents
// ---------------------------------------------------------------------------

/// README and top-level package/product manifests get enlarged snippet and
/// chunk budgets.
pub fn is_overview_document(basename: &str) -> bool {
    let lower = basename.to_lowercase();
    if lower.starts_with("readme") {
        return true;
    }
    matches!(
        lower.as_str(),
        "package.json"
            | "cargo.toml"
            | "pyproject.toml"
            | "go.mod"
            | "pom.xml"
            | "build.gradle"
            | "composer.json"
            | "gemfile"
    )
}

// ---------------------------------------------------------------------------
// File-content cache
// ---------------------------------------------------------------------------

struct CachedFile {
    content: Arc<str>,
    cached_at: Instant,
}

/// Bounded concurrent cache of file contents, shared by the extraction workers.
/// Entries expire lazily; when full, the oldest entries are evicted.
pub struct FileCache {
    inner: DashMap<String, CachedFile>,
    capacity: usize,
    ttl: Duration,
}

impl FileCache {
    pub fn new() -> Self {
        Self::with_capacity(FILE_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: DashMap::new(),
            capacity: capacity.max(1),
            ttl: Duration::from_secs(FILE_CACHE_TTL_SECS),
        }
    }

    pub fn get(&self, uri: &str) -> Option<Arc<str>> {
        let key = canon_uri(uri);
        let expired = match self.inner.get(&key) {
            Some(hit) => {
                if hit.cached_at.elapsed() <= self.ttl {
                    return Some(Arc::clone(&hit.content));
                }
                true
            }
            None => false,
        };
        if expired {
            self.inner.remove(&key);
        }
        None
    }

    pub fn put(&self, uri: &str, content: Arc<str>) {
        if self.inner.len() >= self.capacity {
            self.evict_oldest(self.capacity / 10 + 1);
        }
        self.inner.insert(canon_uri(uri), CachedFile { content, cached_at: Instant::now() });
    }

    pub fn invalidate(&self, uri: &str) {
        self.inner.remove(&canon_uri(uri));
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn memory_estimate(&self) -> usize {
        self.inner.iter().map(|kv| kv.key().len() + kv.value().content.len()).sum()
    }

    fn evict_oldest(&self, count: usize) {
        let mut ages: Vec<(String, Instant)> =
            self.inner.iter().map(|kv| (kv.key().clone(), kv.value().cached_at)).collect();
        ages.sort_by_key(|(_, at)| *at);
        for (key, _) in ages.into_iter().take(count) {
            self.inner.remove(&key);
        }
    }
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Binary detection
// ---------------------------------------------------------------------------

/// Text check: no null byte in the first 8KB.
pub fn looks_textual(content: &str) -> bool {
    let window = &content.as_bytes()[..content.len().min(8192)];
    !window.contains(&0)
}

// ---------------------------------------------------------------------------
// Character chunking
// ---------------------------------------------------------------------------

/// Split `content` into up to `max_chunks` chunks of roughly `chunk_size`
/// characters, aligned to line boundaries, overlapping by about `overlap`
/// characters. Line ranges are 1-based and inclusive.
pub fn char_chunks(
    content: &str,
    chunk_size: usize,
    max_chunks: usize,
    overlap: usize,
) -> Vec<Chunk> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() || max_chunks == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < lines.len() && chunks.len() < max_chunks {
        let mut end = start;
        let mut length = 0usize;
        while end < lines.len() && length < chunk_size {
            length += lines[end].len() + 1;
            end += 1;
        }

        let text = lines[start..end].join("\n");
        if !text.trim().is_empty() {
            chunks.push(Chunk {
                tokens: tokenize(&text),
                text,
                start_line: start + 1,
                end_line: end,
                embedding: None,
            });
        }

        if end >= lines.len() {
            break;
        }

        // Walk back over the tail of this chunk for the overlap window,
        // always advancing by at least one line.
        let mut next = end;
        let mut walked = 0usize;
        while next > start + 1 && walked < overlap {
            next -= 1;
            walked += lines[next].len() + 1;
        }
        start = next.max(start + 1);
    }

    chunks
}

/// Leading text window capped at `budget` characters, cut at a line boundary.
/// Returns the snippet and its 1-based inclusive end line.
pub fn leading_snippet(content: &str, budget: usize) -> (String, usize) {
    let mut snippet = String::new();
    let mut end_line = 0usize;
    for line in content.lines() {
        if !snippet.is_empty() && snippet.len() + line.len() + 1 > budget {
            break;
        }
        if !snippet.is_empty() {
            snippet.push('\n');
        }
        // A single oversized first line is truncated at a char boundary.
        if snippet.is_empty() && line.len() > budget {
            let mut cut = budget;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            snippet.push_str(&line[..cut]);
            end_line = 1;
            break;
        }
        snippet.push_str(line);
        end_line += 1;
    }
    (snippet, end_line.max(1))
}

// ---------------------------------------------------------------------------
// Extraction pipeline
// ---------------------------------------------------------------------------

/// Stateless-per-file extractor holding the compiled scanners.
pub struct Extractor {
    symbols: SymbolScanner,
    imports: ImportScanner,
}

impl Extractor {
    pub fn new() -> Self {
        Self { symbols: SymbolScanner::new(), imports: ImportScanner::new() }
    }

    /// Read and index one file. Returns `None` only when the file should not
    /// be indexed at all (unreadable, binary, oversized); any later failure
    /// degrades to an entry with no chunks.
    pub fn extract_entry(
        &self,
        uri: &str,
        abs_path: &Path,
        config: &EngineConfig,
        collab: &Collaborators,
        file_cache: &FileCache,
        cancel: &CancelToken,
    ) -> Option<IndexEntry> {
        let content = match file_cache.get(uri) {
            Some(cached) => cached,
            None => {
                if let Ok(stat) = collab.fs.stat(abs_path) {
                    if stat.size as usize > config.max_file_size {
                        debug!(uri, size = stat.size, "Skipping oversized file");
                        return None;
                    }
                }
                let raw = match collab.fs.read_to_string(abs_path) {
                    Ok(raw) => raw,
                    Err(e) => {
                        debug!(uri, error = %e, "Skipping unreadable file");
                        return None;
                    }
                };
                if !looks_textual(&raw) {
                    return None;
                }
                let shared: Arc<str> = Arc::from(raw.as_str());
                file_cache.put(uri, Arc::clone(&shared));
                shared
            }
        };

        Some(self.build_entry(uri, &content, config, collab, cancel))
    }

    /// Build an entry from already-loaded content.
    pub fn build_entry(
        &self,
        uri: &str,
        content: &str,
        config: &EngineConfig,
        collab: &Collaborators,
        cancel: &CancelToken,
    ) -> IndexEntry {
        let overview = is_overview_document(uri_basename(uri));
        let (snippet_budget, chunk_size, chunk_count) = if overview {
            (OVERVIEW_SNIPPET_BUDGET, OVERVIEW_CHUNK_SIZE, OVERVIEW_CHUNK_COUNT)
        } else {
            (SNIPPET_BUDGET, CHUNK_SIZE, CHUNK_COUNT)
        };

        let (snippet, snippet_end_line) = leading_snippet(content, snippet_budget);

        let ast = collab.ast.as_ref().filter(|a| config.ast_enabled && a.is_enabled());

        // Symbols: AST collaborator first, regex scanner otherwise.
        let mut ast_symbols = None;
        let symbols = match ast {
            Some(service) => match service.extract_symbols(uri, content) {
                Ok(nodes) => {
                    let flat = flatten_symbols(&nodes);
                    ast_symbols = Some(nodes);
                    flat
                }
                Err(e) => {
                    debug!(uri, error = %e, "AST symbol extraction failed, using scanner");
                    self.symbols.extract_for_uri(uri, content)
                }
            },
            None => self.symbols.extract_for_uri(uri, content),
        };

        // Chunks: AST boundaries when available, character chunking otherwise.
        let chunks = match (ast, &ast_symbols) {
            (Some(service), Some(nodes)) => {
                match service.create_ast_chunks(uri, content, nodes) {
                    Ok(ast_chunks) if !ast_chunks.is_empty() => ast_chunks
                        .into_iter()
                        .map(|c| Chunk {
                            tokens: tokenize(&c.text),
                            text: c.text,
                            start_line: c.start_line,
                            end_line: c.end_line,
                            embedding: None,
                        })
                        .collect(),
                    Ok(_) => char_chunks(content, chunk_size, chunk_count, CHUNK_OVERLAP),
                    Err(e) => {
                        debug!(uri, error = %e, "AST chunking failed, using character chunks");
                        char_chunks(content, chunk_size, chunk_count, CHUNK_OVERLAP)
                    }
                }
            }
            _ => char_chunks(content, chunk_size, chunk_count, CHUNK_OVERLAP),
        };

        // Import relationships for script-family files.
        let import_scan = match uri_extension(uri).as_deref() {
            Some("ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs") => self.imports.scan(content),
            _ => Default::default(),
        };

        let mut entry = IndexEntry {
            uri: uri.to_string(),
            symbols,
            snippet,
            snippet_start_line: 1,
            snippet_end_line,
            chunks,
            imported_symbols: import_scan.imported_symbols,
            imported_from: import_scan.imported_from,
            ..Default::default()
        };
        entry.rebuild_token_sets();

        embed::embed_entry(&mut entry, collab, cancel);

        entry
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overview_detection() {
        assert!(is_overview_document("README.md"));
        assert!(is_overview_document("readme"));
        assert!(is_overview_document("package.json"));
        assert!(is_overview_document("Cargo.toml"));
        assert!(!is_overview_document("index.ts"));
    }

    #[test]
    fn test_char_chunks_line_ranges() {
        let content = (1..=20).map(|i| format!("line number {i}")).collect::<Vec<_>>().join("\n");
        let chunks = char_chunks(&content, 60, 5, 20);
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].start_line, 1);
        for chunk in &chunks {
            assert!(chunk.start_line >= 1);
            assert!(chunk.end_line >= chunk.start_line);
            // The chunk text must equal the named line range.
            let lines: Vec<&str> = content.lines().collect();
            let expected = lines[chunk.start_line - 1..chunk.end_line].join("\n");
            assert_eq!(chunk.text, expected);
        }
        // Consecutive chunks overlap.
        for window in chunks.windows(2) {
            assert!(window[1].start_line <= window[0].end_line);
            assert!(window[1].start_line > window[0].start_line);
        }
    }

    #[test]
    fn test_char_chunks_bounded() {
        let content = "x\n".repeat(10_000);
        let chunks = char_chunks(&content, CHUNK_SIZE, CHUNK_COUNT, CHUNK_OVERLAP);
        assert_eq!(chunks.len(), CHUNK_COUNT);
    }

    #[test]
    fn test_char_chunks_empty() {
        assert!(char_chunks("", 400, 5, 100).is_empty());
        assert!(char_chunks("\n\n\n", 400, 5, 100).is_empty());
    }

    #[test]
    fn test_leading_snippet() {
        let (snippet, end) = leading_snippet("alpha\nbeta\ngamma", 11);
        assert_eq!(snippet, "alpha\nbeta");
        assert_eq!(end, 2);

        let long = "y".repeat(1000);
        let (snippet, end) = leading_snippet(&long, 400);
        assert_eq!(snippet.len(), 400);
        assert_eq!(end, 1);
    }

    #[test]
    fn test_looks_textual() {
        assert!(looks_textual("plain text"));
        assert!(!looks_textual("bin\0ary"));
    }

    #[test]
    fn test_file_cache_roundtrip_and_invalidate() {
        let cache = FileCache::with_capacity(4);
        cache.put("Src/A.ts", Arc::from("content"));
        assert_eq!(cache.get("src/a.ts").as_deref(), Some("content"));
        cache.invalidate("SRC/a.ts");
        assert!(cache.get("src/a.ts").is_none());
    }

    #[test]
    fn test_file_cache_eviction() {
        let cache = FileCache::with_capacity(3);
        for i in 0..5 {
            cache.put(&format!("f{i}"), Arc::from("x"));
        }
        assert!(cache.len() <= 3);
    }

    #[test]
    fn test_build_entry_plain() {
        let extractor = Extractor::new();
        let config = EngineConfig::default();
        let collab = Collaborators::default();
        let cancel = CancelToken::new();
        let content = "export function parseUserInput(raw) {\n  return raw.trim();\n}\n";
        let entry = extractor.build_entry("src/input.ts", content, &config, &collab, &cancel);
        assert_eq!(entry.symbols, vec!["parseUserInput"]);
        assert!(entry.snippet_tokens.contains("parseuserinput"));
        assert!(!entry.chunks.is_empty());
        assert_eq!(entry.snippet_start_line, 1);
        assert!(entry.snippet_embedding.is_none());
    }

    #[test]
    fn test_overview_budgets() {
        let extractor = Extractor::new();
        let config = EngineConfig::default();
        let collab = Collaborators::default();
        let cancel = CancelToken::new();
        let content = (0..200).map(|i| format!("## Section {i} with some text")).collect::<Vec<_>>().join("\n");
        let overview = extractor.build_entry("README.md", &content, &config, &collab, &cancel);
        let regular = extractor.build_entry("notes.md", &content, &config, &collab, &cancel);
        assert!(overview.snippet.len() > regular.snippet.len());
        assert!(overview.chunks.len() <= OVERVIEW_CHUNK_COUNT);
        assert_eq!(regular.chunks.len(), CHUNK_COUNT);
    }
}
