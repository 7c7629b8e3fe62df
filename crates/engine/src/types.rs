use coderag_core::tokenize;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum file size (in bytes) that will be read into memory.
pub const MAX_FILE_READ: usize = 512 * 1024;

/// Current on-disk index schema version.
pub const INDEX_VERSION: &str = "1.0.0";

/// Leading snippet budget in characters (regular / overview documents).
pub const SNIPPET_BUDGET: usize = 400;
pub const OVERVIEW_SNIPPET_BUDGET: usize = 800;

/// Character-chunking shape (regular / overview documents).
pub const CHUNK_SIZE: usize = 400;
pub const CHUNK_COUNT: usize = 5;
pub const OVERVIEW_CHUNK_SIZE: usize = 600;
pub const OVERVIEW_CHUNK_COUNT: usize = 3;
pub const CHUNK_OVERLAP: usize = 100;

/// Per-query wall-clock deadline.
pub const QUERY_TIMEOUT_MS: u64 = 150;

/// Cache capacities.
pub const RESULT_CACHE_CAPACITY: usize = 200;
pub const EMBEDDING_CACHE_CAPACITY: usize = 50;
pub const FILE_CACHE_CAPACITY: usize = 500;
pub const FILE_CACHE_TTL_SECS: u64 = 300;

/// Candidate-selection caps.
pub const EMPTY_QUERY_CANDIDATE_CAP: usize = 100;
pub const INTERSECTION_RECALL_FLOOR: usize = 10;
pub const UNION_AUGMENT_CAP: usize = 50;

/// Scoring-loop guardrails.
pub const LAZY_CHUNK_MIN_SCORE: f32 = 2.0;
pub const EARLY_TERMINATION_SCORE: f32 = 5.0;
pub const EARLY_TERMINATION_COUNT: usize = 50;

/// Progressive-indexing pacing.
pub const INDEX_BATCH_SIZE: usize = 10;
pub const INDEX_BATCH_DELAY_MS: u64 = 1_000;
pub const WALK_YIELD_INTERVAL: usize = 50;
pub const CPU_CHECK_INTERVAL_MS: u64 = 100;
pub const CPU_THROTTLE_SLEEP_MS: u64 = 50;

/// Debounce windows.
pub const WATCH_DEBOUNCE_MS: u64 = 3_000;
pub const SAVE_DEBOUNCE_MS: u64 = 5_000;

/// Self-protection thresholds.
pub const LATENCY_WINDOW: usize = 10;
pub const SELF_DISABLE_MIN_QUERIES: usize = 5;
pub const SELF_DISABLE_AVG_MS: f64 = 200.0;
pub const MEMORY_CHECK_INTERVAL_SECS: u64 = 30;
pub const MEMORY_SOFT_LIMIT_BYTES: usize = 150 * 1024 * 1024;
pub const MEMORY_HARD_LIMIT_BYTES: usize = 300 * 1024 * 1024;

/// Entries per chunk when streaming a persisted index into memory.
pub const LOAD_CHUNK_SIZE: usize = 1_000;

// ---------------------------------------------------------------------------
// URI helpers
// ---------------------------------------------------------------------------

/// Canonical lookup form of a URI: lower-cased, forward slashes.
pub fn canon_uri(uri: &str) -> String {
    uri.replace('\\', "/").to_lowercase()
}

/// File extension of a URI, lower-cased, without the dot.
pub fn uri_extension(uri: &str) -> Option<String> {
    let name = uri.rsplit('/').next().unwrap_or(uri);
    name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()).filter(|e| !e.is_empty())
}

/// Basename of a URI.
pub fn uri_basename(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

/// Every ancestor directory of a canonical URI, shallowest first.
/// `"src/query/plan.ts"` yields `["src", "src/query"]`.
pub fn ancestor_dirs(canon: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let mut end = 0usize;
    let bytes = canon.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'/' && i > end {
            dirs.push(canon[..i].to_string());
            end = i;
        }
    }
    dirs
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// A contiguous region of a file with its line range and optional annotations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Chunk {
    pub text: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub tokens: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// One indexed file's record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexEntry {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snippet: String,
    #[serde(default)]
    pub snippet_start_line: usize,
    #[serde(default)]
    pub snippet_end_line: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<Chunk>,
    /// Pre-computed token sets. Invariant: always equal to `tokenize` of the
    /// corresponding source field; rebuilt whenever that field changes.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub snippet_tokens: HashSet<String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub uri_tokens: HashSet<String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub symbol_tokens: HashSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imported_symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imported_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_embedding: Option<Vec<f32>>,
}

impl IndexEntry {
    /// Recompute every derived token set from its source field.
    pub fn rebuild_token_sets(&mut self) {
        self.snippet_tokens = tokenize(&self.snippet);
        self.uri_tokens = tokenize(&self.uri);
        let mut symbol_tokens = HashSet::new();
        for symbol in &self.symbols {
            symbol_tokens.extend(tokenize(symbol));
        }
        self.symbol_tokens = symbol_tokens;
        for chunk in &mut self.chunks {
            if chunk.tokens.is_empty() {
                chunk.tokens = tokenize(&chunk.text);
            }
        }
    }

    /// True when any derived token set is missing for a non-empty source field.
    pub fn token_sets_missing(&self) -> bool {
        (!self.snippet.is_empty() && self.snippet_tokens.is_empty())
            || (!self.uri.is_empty() && self.uri_tokens.is_empty())
            || (!self.symbols.is_empty() && self.symbol_tokens.is_empty())
            || self.chunks.iter().any(|c| !c.text.is_empty() && c.tokens.is_empty())
    }

    pub fn language(&self) -> Option<String> {
        uri_extension(&self.uri)
    }

    /// Embedding for chunk `i`, if one was computed.
    pub fn chunk_embedding(&self, i: usize) -> Option<&[f32]> {
        self.chunks.get(i).and_then(|c| c.embedding.as_deref())
    }

    /// Rough in-memory footprint in bytes, for the memory-pressure monitor.
    pub fn memory_estimate(&self) -> usize {
        let mut total = self.uri.len() + self.snippet.len();
        total += self.symbols.iter().map(|s| s.len()).sum::<usize>();
        total += self.imported_symbols.iter().map(|s| s.len()).sum::<usize>();
        total += self.imported_from.iter().map(|s| s.len()).sum::<usize>();
        total += self.snippet_tokens.iter().map(|t| t.len() + 16).sum::<usize>();
        total += self.uri_tokens.iter().map(|t| t.len() + 16).sum::<usize>();
        total += self.symbol_tokens.iter().map(|t| t.len() + 16).sum::<usize>();
        total += self.snippet_embedding.as_ref().map(|e| e.len() * 4).unwrap_or(0);
        for chunk in &self.chunks {
            total += chunk.text.len();
            total += chunk.tokens.iter().map(|t| t.len() + 16).sum::<usize>();
            total += chunk.embedding.as_ref().map(|e| e.len() * 4).unwrap_or(0);
        }
        total
    }
}

/// Index-level metadata, persisted alongside the entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub version: String,
    pub file_count: usize,
    /// Milliseconds since the Unix epoch.
    pub last_updated: u64,
    #[serde(default)]
    pub corrupted: bool,
    #[serde(default)]
    pub needs_rebuild: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<f64>,
}

impl Default for IndexMetadata {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            file_count: 0,
            last_updated: 0,
            corrupted: false,
            needs_rebuild: false,
            total_size: None,
        }
    }
}

pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which external vector store (if any) to consult for hybrid search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreKind {
    #[default]
    None,
    External,
}

/// Runtime configuration. Loaded from `.coderag.toml` at the workspace root
/// when present; every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fraction of one core the progressive indexer may consume (0..=1).
    pub indexer_cpu_budget: f64,
    /// Worker pool size for batch extraction.
    pub indexer_parallelism: usize,
    /// Query-result cache TTL in milliseconds.
    pub router_cache_ttl_ms: u64,
    /// Per-query wall-clock deadline in milliseconds.
    pub query_timeout_ms: u64,
    /// Which external vector store to consult.
    pub vector_store: VectorStoreKind,
    /// Whether to call the AST collaborator for symbols and chunks.
    pub ast_enabled: bool,
    /// Directory names never descended into.
    pub skip_dirs: HashSet<String>,
    /// File extensions accepted for indexing.
    pub extensions: HashSet<String>,
    /// Files larger than this are skipped.
    pub max_file_size: usize,
    /// Override for the directory the index file is written to. Defaults to
    /// the per-user application data directory.
    pub index_dir: Option<std::path::PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            indexer_cpu_budget: 0.2,
            indexer_parallelism: 2,
            router_cache_ttl_ms: 30_000,
            query_timeout_ms: QUERY_TIMEOUT_MS,
            vector_store: VectorStoreKind::None,
            ast_enabled: true,
            skip_dirs: [
                ".git",
                ".hg",
                ".svn",
                ".coderag",
                "node_modules",
                "__pycache__",
                "target",
                "dist",
                "build",
                "out",
                ".next",
                "vendor",
                "coverage",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            extensions: [
                "ts", "tsx", "js", "jsx", "mjs", "cjs", "rs", "go", "py", "rb", "java", "kt",
                "swift", "c", "cc", "cpp", "h", "hpp", "cs", "php", "lua", "sh", "md", "json",
                "toml", "yaml", "yml",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_file_size: MAX_FILE_READ,
            index_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `<root>/.coderag.toml`, falling back to defaults
    /// for a missing file or any field it omits. A malformed file is logged and
    /// ignored.
    pub fn load(root: &Path) -> Self {
        let path = root.join(".coderag.toml");
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };
        match toml::from_str::<EngineConfig>(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed config");
                Self::default()
            }
        }
    }

    /// Should this file be indexed at all, judged by name alone?
    pub fn accepts(&self, rel_path: &str) -> bool {
        if crate::extract::is_overview_document(uri_basename(rel_path)) {
            return true;
        }
        match uri_extension(rel_path) {
            Some(ext) => self.extensions.contains(&ext),
            None => false,
        }
    }

    /// True when any path component is an excluded directory.
    pub fn is_excluded_path(&self, rel_path: &str) -> bool {
        rel_path.split('/').any(|part| self.skip_dirs.contains(part))
    }
}

// ---------------------------------------------------------------------------
// Query metrics
// ---------------------------------------------------------------------------

/// Per-query measurements, returned next to the formatted results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryMetrics {
    pub retrieval_latency_ms: u64,
    /// Sum of ceil(len/4) over the returned result blocks.
    pub tokens_injected: usize,
    pub results_count: usize,
    pub top_score: f32,
    pub timed_out: bool,
    pub early_terminated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hybrid_search_used: Option<bool>,
}

/// Result of `query_with_metrics`.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    pub results: Vec<String>,
    pub metrics: QueryMetrics,
}

/// Character-count token estimate used for `tokens_injected`.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag, checked by every long-running loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Index stats snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of index health.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub file_count: usize,
    pub term_count: usize,
    pub symbol_count: usize,
    pub memory_estimate_bytes: usize,
    pub last_updated: u64,
    pub needs_rebuild: bool,
    pub scoring_disabled: bool,
}

/// Workspace identifier derived from the root path: directory name plus a
/// short stable hash, safe for use as a file name.
pub fn workspace_id_for_root(root: &Path) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    root.to_string_lossy().hash(&mut hasher);
    let name: String = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "workspace".to_string())
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("{}-{:016x}", name, hasher.finish())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canon_uri() {
        assert_eq!(canon_uri("Src\\Query\\Plan.TS"), "src/query/plan.ts");
    }

    #[test]
    fn test_uri_extension() {
        assert_eq!(uri_extension("src/a.ts"), Some("ts".to_string()));
        assert_eq!(uri_extension("src/Makefile"), None);
        assert_eq!(uri_extension("a.d.TS"), Some("ts".to_string()));
    }

    #[test]
    fn test_ancestor_dirs() {
        assert_eq!(ancestor_dirs("src/query/plan.ts"), vec!["src", "src/query"]);
        assert!(ancestor_dirs("plan.ts").is_empty());
    }

    #[test]
    fn test_rebuild_token_sets() {
        let mut entry = IndexEntry {
            uri: "src/parser.ts".to_string(),
            symbols: vec!["parseUserInput".to_string()],
            snippet: "export function parseUserInput()".to_string(),
            ..Default::default()
        };
        entry.rebuild_token_sets();
        assert!(entry.snippet_tokens.contains("parseuserinput"));
        assert!(entry.uri_tokens.contains("parser"));
        assert!(entry.symbol_tokens.contains("parseuserinput"));
        assert!(!entry.token_sets_missing());
    }

    #[test]
    fn test_config_accepts() {
        let config = EngineConfig::default();
        assert!(config.accepts("src/main.rs"));
        assert!(config.accepts("README.md"));
        assert!(config.accepts("package.json"));
        assert!(!config.accepts("logo.png"));
        assert!(config.is_excluded_path("node_modules/lib/a.js"));
        assert!(!config.is_excluded_path("src/a.js"));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_workspace_id_stable() {
        let a = workspace_id_for_root(Path::new("/tmp/my proj"));
        let b = workspace_id_for_root(Path::new("/tmp/my proj"));
        assert_eq!(a, b);
        assert!(a.starts_with("my-proj-"));
    }
}
