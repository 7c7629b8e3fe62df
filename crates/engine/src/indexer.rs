//! Progressive indexer: priority-ordered, batch-paced, CPU-budgeted background
//! indexing of a workspace tree.
//!
//! The walk is sequential (it only lists files); extraction inside each batch
//! fans out across a small worker pool, and all index mutation happens on the
//! controlling thread after the workers join.

use crate::engine::EngineState;
use crate::extract::{is_overview_document, Extractor, FileCache};
use crate::persist::SaveScheduler;
use crate::query::rebuild_common_pools;
use crate::services::Collaborators;
use crate::types::{
    uri_basename, CancelToken, EngineConfig, IndexEntry, CPU_CHECK_INTERVAL_MS,
    CPU_THROTTLE_SLEEP_MS, INDEX_BATCH_DELAY_MS, INDEX_BATCH_SIZE, WALK_YIELD_INTERVAL,
};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Priority tiers
// ---------------------------------------------------------------------------

/// Indexing priority; lower sorts earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
    Lowest = 4,
}

const SOURCE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "rs", "go", "py", "java", "kt", "swift", "c", "cc",
    "cpp", "h", "hpp", "cs", "rb", "php", "lua",
];

/// Classify a relative path into its indexing tier.
pub fn classify(rel_path: &str) -> Priority {
    let basename = uri_basename(rel_path);
    let lower = basename.to_lowercase();

    // Generated and build outputs last.
    if lower.ends_with(".map") || lower.ends_with(".d.ts") || lower.ends_with(".min.js") {
        return Priority::Lowest;
    }
    let path_lower = rel_path.to_lowercase();
    if path_lower.split('/').any(|part| matches!(part, "generated" | "gen" | "__generated__")) {
        return Priority::Lowest;
    }

    // Entry points and overview documents first.
    if is_overview_document(basename) {
        return Priority::Critical;
    }
    let stem = lower.rsplit_once('.').map(|(s, _)| s).unwrap_or(&lower);
    if matches!(stem, "index" | "main" | "app") {
        return Priority::Critical;
    }

    // Tests and docs late.
    let is_test = path_lower.split('/').any(|part| matches!(part, "test" | "tests" | "__tests__"))
        || stem.ends_with(".test")
        || stem.ends_with(".spec")
        || stem.ends_with("_test");
    let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    if is_test || matches!(ext, "md" | "rst" | "txt" | "adoc") {
        return Priority::Low;
    }

    if SOURCE_EXTENSIONS.contains(&ext) {
        return Priority::High;
    }
    Priority::Medium
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// A file accepted for indexing.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub priority: Priority,
}

/// Walk the workspace and collect accepted files. The walk yields to the
/// scheduler and checks cancellation every few dozen steps; excluded
/// directories are never descended into.
pub fn discover_files(root: &Path, config: &EngineConfig, cancel: &CancelToken) -> Vec<WorkItem> {
    let mut items = Vec::new();
    let skip = config.skip_dirs.clone();

    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(move |entry| {
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                let name = entry.file_name().to_string_lossy();
                return !skip.contains(name.as_ref());
            }
            true
        })
        .build();

    for (steps, entry) in walker.enumerate() {
        if steps % WALK_YIELD_INTERVAL == 0 {
            if cancel.is_cancelled() {
                return items;
            }
            std::thread::yield_now();
        }
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let abs_path = entry.path().to_path_buf();
        let rel_path = abs_path
            .strip_prefix(root)
            .unwrap_or(&abs_path)
            .to_string_lossy()
            .replace('\\', "/");
        if !config.accepts(&rel_path) || config.is_excluded_path(&rel_path) {
            continue;
        }
        items.push(WorkItem { priority: classify(&rel_path), abs_path, rel_path });
    }

    items.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.rel_path.cmp(&b.rel_path)));
    items
}

// ---------------------------------------------------------------------------
// CPU budget
// ---------------------------------------------------------------------------

/// Tracks time spent doing indexing work inside a sliding window and sleeps
/// when the busy fraction exceeds the configured budget.
pub struct CpuBudget {
    window_start: Instant,
    busy: Duration,
    budget: f64,
}

impl CpuBudget {
    pub fn new(budget: f64) -> Self {
        Self { window_start: Instant::now(), busy: Duration::ZERO, budget: budget.clamp(0.01, 1.0) }
    }

    pub fn record(&mut self, spent: Duration) {
        self.busy += spent;
    }

    /// Called between units of work. Sleeps when the current window is over
    /// budget, then starts a fresh window.
    pub fn throttle(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_millis(CPU_CHECK_INTERVAL_MS) {
            return;
        }
        let busy_fraction = self.busy.as_secs_f64() / elapsed.as_secs_f64().max(1e-6);
        if busy_fraction > self.budget {
            std::thread::sleep(Duration::from_millis(CPU_THROTTLE_SLEEP_MS));
        }
        self.window_start = Instant::now();
        self.busy = Duration::ZERO;
    }
}

// ---------------------------------------------------------------------------
// Progressive run
// ---------------------------------------------------------------------------

/// Extract a batch of files across `workers` threads. Workers produce entries
/// without touching shared state; the caller applies them under the write lock.
fn extract_batch(
    batch: &[WorkItem],
    workers: usize,
    config: &EngineConfig,
    collab: &Collaborators,
    extractor: &Extractor,
    file_cache: &FileCache,
    cancel: &CancelToken,
) -> Vec<IndexEntry> {
    let workers = workers.clamp(1, batch.len().max(1));
    let group_size = batch.len().div_ceil(workers);
    let groups: Vec<&[WorkItem]> = batch.chunks(group_size.max(1)).collect();

    std::thread::scope(|scope| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                scope.spawn(move || {
                    let mut extracted = Vec::with_capacity(group.len());
                    for item in group {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if let Some(entry) = extractor.extract_entry(
                            &item.rel_path,
                            &item.abs_path,
                            config,
                            collab,
                            file_cache,
                            cancel,
                        ) {
                            extracted.push(entry);
                        }
                    }
                    extracted
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap_or_default()).collect()
    })
}

/// Run a full progressive indexing pass over the workspace. Cancellable at
/// every batch boundary; paced by the batch delay and the CPU budget.
pub fn run(
    state: &Arc<RwLock<EngineState>>,
    collab: &Arc<Collaborators>,
    extractor: &Arc<Extractor>,
    file_cache: &Arc<FileCache>,
    saver: &Arc<SaveScheduler>,
    cancel: &CancelToken,
) {
    let (root, config) = {
        let s = state.read().unwrap();
        (s.root.clone(), s.config.clone())
    };

    let started = Instant::now();
    let items = discover_files(&root, &config, cancel);
    if cancel.is_cancelled() {
        debug!("Progressive indexing cancelled during discovery");
        return;
    }
    info!(files = items.len(), "Progressive indexing started");

    let mut cpu = CpuBudget::new(config.indexer_cpu_budget);
    let mut indexed = 0usize;
    let total_batches = items.len().div_ceil(INDEX_BATCH_SIZE.max(1));

    for (batch_number, batch) in items.chunks(INDEX_BATCH_SIZE).enumerate() {
        if cancel.is_cancelled() {
            debug!(indexed, "Progressive indexing cancelled");
            return;
        }
        if state.read().unwrap().indexing_halted {
            warn!(indexed, "Progressive indexing halted by memory pressure");
            return;
        }

        let busy_start = Instant::now();
        let entries = extract_batch(
            batch,
            config.indexer_parallelism,
            &config,
            collab,
            extractor,
            file_cache,
            cancel,
        );

        {
            let mut s = state.write().unwrap();
            for entry in entries {
                let snippet = entry.snippet.clone();
                let index = s.store.add(entry);
                s.stats.upsert(index, &snippet);
                indexed += 1;
            }
            s.metadata.file_count = s.store.len();
            s.metadata.last_updated = crate::types::epoch_ms();
        }
        cpu.record(busy_start.elapsed());
        cpu.throttle();
        saver.schedule();

        // Pace between batches, staying responsive to cancellation.
        if batch_number + 1 < total_batches {
            let mut waited = 0u64;
            while waited < INDEX_BATCH_DELAY_MS {
                if cancel.is_cancelled() {
                    return;
                }
                let step = 100.min(INDEX_BATCH_DELAY_MS - waited);
                std::thread::sleep(Duration::from_millis(step));
                waited += step;
            }
        }
    }

    {
        let mut s = state.write().unwrap();
        s.metadata.needs_rebuild = false;
        s.metadata.corrupted = false;
        let pools = rebuild_common_pools(&s.store);
        s.common_pools = pools;
        s.caches.clear();
    }
    saver.schedule();
    info!(
        files = indexed,
        time_ms = started.elapsed().as_millis() as u64,
        "Progressive indexing complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_tiers() {
        assert_eq!(classify("README.md"), Priority::Critical);
        assert_eq!(classify("package.json"), Priority::Critical);
        assert_eq!(classify("src/index.ts"), Priority::Critical);
        assert_eq!(classify("src/main.rs"), Priority::Critical);
        assert_eq!(classify("src/query.ts"), Priority::High);
        assert_eq!(classify("assets/data.json"), Priority::Medium);
        assert_eq!(classify("src/query.test.ts"), Priority::Low);
        assert_eq!(classify("tests/fixtures.rs"), Priority::Low);
        assert_eq!(classify("docs/guide.txt"), Priority::Low);
        assert_eq!(classify("dist/bundle.js.map"), Priority::Lowest);
        assert_eq!(classify("types/api.d.ts"), Priority::Lowest);
        assert_eq!(classify("src/generated/schema.ts"), Priority::Lowest);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert!(Priority::Low < Priority::Lowest);
    }

    #[test]
    fn test_discover_respects_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/lib")).unwrap();
        std::fs::write(root.join("src/a.ts"), "export const a = 1;").unwrap();
        std::fs::write(root.join("node_modules/lib/b.ts"), "export const b = 2;").unwrap();
        std::fs::write(root.join("README.md"), "# Readme").unwrap();
        std::fs::write(root.join("logo.png"), "png").unwrap();

        let config = EngineConfig::default();
        let items = discover_files(root, &config, &CancelToken::new());
        let rels: Vec<&str> = items.iter().map(|i| i.rel_path.as_str()).collect();
        assert_eq!(rels, vec!["README.md", "src/a.ts"]);
    }

    #[test]
    fn test_discover_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "x").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let items = discover_files(dir.path(), &EngineConfig::default(), &cancel);
        assert!(items.is_empty());
    }

    #[test]
    fn test_cpu_budget_resets_window() {
        let mut cpu = CpuBudget::new(0.5);
        cpu.record(Duration::from_millis(1));
        cpu.throttle();
        // No panic, fields reset when past the check interval.
        std::thread::sleep(Duration::from_millis(CPU_CHECK_INTERVAL_MS + 10));
        cpu.record(Duration::from_millis(1));
        cpu.throttle();
    }
}
