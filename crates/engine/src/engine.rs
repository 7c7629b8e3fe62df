//! Engine facade: owns all retrieval state, wires the background machinery
//! (progressive indexer, watcher, debounced saves, memory monitor), and
//! exposes the stable public API: `warm_index`, `query`, `query_with_metrics`,
//! `rebuild_index`, `dispose`.
//!
//! All shared state lives behind one `RwLock` and is mutated only by the
//! controlling paths here and in the watcher; extraction workers produce
//! values without touching the shared maps.

use crate::extract::{Extractor, FileCache};
use crate::indexer;
use crate::persist::{self, SaveScheduler};
use crate::query::{self, QueryCaches, QueryContext};
use crate::services::Collaborators;
use crate::stats::Bm25Stats;
use crate::store::IndexStore;
use crate::types::{
    workspace_id_for_root, CancelToken, EngineConfig, IndexEntry, IndexMetadata, IndexStats,
    QueryOutcome, LATENCY_WINDOW, MEMORY_CHECK_INTERVAL_SECS, MEMORY_HARD_LIMIT_BYTES,
    MEMORY_SOFT_LIMIT_BYTES, SELF_DISABLE_AVG_MS, SELF_DISABLE_MIN_QUERIES,
};
use crate::watch;
use coderag_core::TokenCache;
use notify::RecommendedWatcher;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Default result count for queries.
pub const DEFAULT_RESULT_COUNT: usize = 5;

// ---------------------------------------------------------------------------
// Latency ring buffer
// ---------------------------------------------------------------------------

/// Last-N query latencies with a running sum: O(1) record and average.
#[derive(Debug, Default)]
pub struct LatencyWindow {
    samples: [u64; LATENCY_WINDOW],
    count: usize,
    next: usize,
    sum: u64,
}

impl LatencyWindow {
    pub fn record(&mut self, latency_ms: u64) {
        if self.count == LATENCY_WINDOW {
            self.sum -= self.samples[self.next];
        } else {
            self.count += 1;
        }
        self.samples[self.next] = latency_ms;
        self.sum += latency_ms;
        self.next = (self.next + 1) % LATENCY_WINDOW;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// Everything mutable behind the engine's single lock.
pub struct EngineState {
    pub root: PathBuf,
    pub workspace_id: String,
    pub config: EngineConfig,
    pub store: IndexStore,
    pub stats: Bm25Stats,
    pub metadata: IndexMetadata,
    pub caches: QueryCaches,
    pub common_pools: HashMap<String, Vec<usize>>,
    pub latency: LatencyWindow,
    pub scoring_disabled: bool,
    pub indexing_halted: bool,
    pub warmed: bool,
}

impl EngineState {
    fn new(root: PathBuf, workspace_id: String, config: EngineConfig) -> Self {
        let caches = QueryCaches::new(config.router_cache_ttl_ms);
        Self {
            root,
            workspace_id,
            config,
            store: IndexStore::new(),
            stats: Bm25Stats::new(),
            metadata: IndexMetadata::default(),
            caches,
            common_pools: HashMap::new(),
            latency: LatencyWindow::default(),
            scoring_disabled: false,
            indexing_halted: false,
            warmed: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One engine per workspace. Created at host startup; loads lazily on the
/// first query; `dispose` flushes a final save and stops every background
/// thread.
pub struct RetrievalEngine {
    state: Arc<RwLock<EngineState>>,
    collab: Arc<Collaborators>,
    extractor: Arc<Extractor>,
    file_cache: Arc<FileCache>,
    token_cache: Arc<TokenCache>,
    saver: Arc<SaveScheduler>,
    save_path: PathBuf,
    index_cancel: Arc<Mutex<CancelToken>>,
    index_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    watch_cancel: CancelToken,
    monitor_cancel: CancelToken,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl RetrievalEngine {
    /// Build an engine over `root`, loading `.coderag.toml` when present.
    pub fn new(root: PathBuf, collab: Collaborators) -> Self {
        let config = EngineConfig::load(&root);
        Self::with_config(root, config, collab)
    }

    pub fn with_config(root: PathBuf, config: EngineConfig, collab: Collaborators) -> Self {
        let workspace_id = collab
            .workspace
            .as_ref()
            .map(|w| w.workspace_id())
            .unwrap_or_else(|| workspace_id_for_root(&root));
        let save_path = config
            .index_dir
            .as_ref()
            .map(|dir| dir.join(format!("{workspace_id}.json")))
            .or_else(|| persist::index_path(&workspace_id))
            .unwrap_or_else(|| persist::legacy_index_path(&root));

        let state = Arc::new(RwLock::new(EngineState::new(root, workspace_id, config)));
        let collab = Arc::new(collab);

        let saver = {
            let state = Arc::clone(&state);
            let collab = Arc::clone(&collab);
            let path = save_path.clone();
            Arc::new(SaveScheduler::start(move || {
                let mut guard = state.write().unwrap();
                let s = &mut *guard;
                let entries: Vec<&IndexEntry> = s.store.iter().map(|(_, e)| e).collect();
                if let Err(e) = persist::save(collab.fs.as_ref(), &path, &mut s.metadata, entries)
                {
                    warn!(error = %e, "Index save failed");
                }
            }))
        };

        let engine = Self {
            state,
            collab,
            extractor: Arc::new(Extractor::new()),
            file_cache: Arc::new(FileCache::new()),
            token_cache: Arc::new(TokenCache::default()),
            saver,
            save_path,
            index_cancel: Arc::new(Mutex::new(CancelToken::new())),
            index_handle: Mutex::new(None),
            watch_cancel: CancelToken::new(),
            monitor_cancel: CancelToken::new(),
            watcher: Mutex::new(None),
        };
        engine.spawn_memory_monitor();
        engine
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Lazy warm-up: load the persisted index when one exists, otherwise (or
    /// when a rebuild is flagged) enqueue progressive indexing. Idempotent.
    pub fn warm_index(&self) {
        {
            let mut s = self.state.write().unwrap();
            if s.warmed {
                return;
            }
            s.warmed = true;
        }

        let root = self.state.read().unwrap().root.clone();

        match persist::load(self.collab.fs.as_ref(), &self.save_path, &root) {
            Ok(Some(loaded)) => {
                let migrated = loaded.migrated;
                let needs_rebuild = loaded.metadata.needs_rebuild;
                let count = loaded.entries.len();
                {
                    let mut s = self.state.write().unwrap();
                    s.metadata = loaded.metadata;
                    for entry in loaded.entries {
                        let snippet = entry.snippet.clone();
                        let index = s.store.add(entry);
                        s.stats.upsert(index, &snippet);
                    }
                    s.metadata.file_count = s.store.len();
                    let pools = query::rebuild_common_pools(&s.store);
                    s.common_pools = pools;
                }
                info!(entries = count, "Loaded persisted index");
                if migrated {
                    self.saver.schedule();
                }
                if needs_rebuild {
                    self.spawn_indexing();
                }
            }
            Ok(None) => {
                info!("No persisted index, starting progressive indexing");
                self.spawn_indexing();
            }
            Err(e) => {
                warn!(error = %e, "Persisted index unreadable, rebuilding");
                {
                    let mut s = self.state.write().unwrap();
                    s.metadata.corrupted = true;
                    s.metadata.needs_rebuild = true;
                }
                self.spawn_indexing();
            }
        }

        let watcher = watch::start_watcher(
            Arc::clone(&self.state),
            Arc::clone(&self.collab),
            Arc::clone(&self.extractor),
            Arc::clone(&self.file_cache),
            Arc::clone(&self.saver),
            self.watch_cancel.clone(),
        );
        *self.watcher.lock().unwrap() = watcher;
    }

    /// Convenience wrapper over [`Self::query_with_metrics`].
    pub fn query(&self, text: &str, k: usize) -> Vec<String> {
        self.query_with_metrics(text, k).results
    }

    /// Run a query and return the formatted results with their metrics.
    /// Never fails; the worst outcome is an empty result list.
    pub fn query_with_metrics(&self, text: &str, k: usize) -> QueryOutcome {
        self.warm_index();

        let outcome = {
            let mut guard = self.state.write().unwrap();
            let s = &mut *guard;
            let mut ctx = QueryContext {
                store: &s.store,
                stats: &mut s.stats,
                caches: &mut s.caches,
                common_pools: &s.common_pools,
                collab: &self.collab,
                token_cache: &self.token_cache,
                timeout: Duration::from_millis(s.config.query_timeout_ms),
                vector_store_kind: s.config.vector_store,
                scoring_disabled: s.scoring_disabled,
            };
            query::run_query(&mut ctx, text, k)
        };

        let mut s = self.state.write().unwrap();
        s.latency.record(outcome.metrics.retrieval_latency_ms);
        if !s.scoring_disabled
            && s.latency.count() >= SELF_DISABLE_MIN_QUERIES
            && s.latency.average() > SELF_DISABLE_AVG_MS
        {
            s.scoring_disabled = true;
            warn!(
                avg_ms = s.latency.average(),
                "Average query latency over threshold, serving fallback until next rebuild"
            );
        }
        outcome
    }

    /// From-scratch rebuild: clears every index and cache, then reindexes the
    /// workspace synchronously. Clears the latency circuit breaker.
    pub fn rebuild_index(&self, cancel: Option<CancelToken>) {
        self.collab.notify_info("Code index rebuild started");
        info!("Index rebuild started");

        self.index_cancel.lock().unwrap().cancel();
        self.wait_for_index();

        {
            let mut s = self.state.write().unwrap();
            s.store.clear();
            s.stats.clear();
            s.caches.clear();
            s.common_pools.clear();
            s.metadata = IndexMetadata { needs_rebuild: true, ..Default::default() };
            s.scoring_disabled = false;
            s.indexing_halted = false;
            s.latency.reset();
            s.warmed = true;
        }
        self.file_cache.clear();

        let token = cancel.unwrap_or_default();
        *self.index_cancel.lock().unwrap() = token.clone();
        indexer::run(
            &self.state,
            &self.collab,
            &self.extractor,
            &self.file_cache,
            &self.saver,
            &token,
        );

        if token.is_cancelled() {
            info!("Index rebuild cancelled");
        } else {
            self.collab.notify_info("Code index rebuild complete");
        }
    }

    /// Point-in-time index health snapshot.
    pub fn index_stats(&self) -> IndexStats {
        let s = self.state.read().unwrap();
        IndexStats {
            file_count: s.store.len(),
            term_count: s.store.term_count(),
            symbol_count: s.store.symbol_count(),
            memory_estimate_bytes: s.store.memory_estimate()
                + s.stats.memory_estimate()
                + self.file_cache.memory_estimate(),
            last_updated: s.metadata.last_updated,
            needs_rebuild: s.metadata.needs_rebuild,
            scoring_disabled: s.scoring_disabled,
        }
    }

    /// Block until any in-flight progressive indexing pass finishes.
    pub fn wait_for_index(&self) {
        let handle = self.index_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Flush a final save synchronously and stop every background thread.
    pub fn dispose(&self) {
        self.monitor_cancel.cancel();
        self.watch_cancel.cancel();
        self.index_cancel.lock().unwrap().cancel();
        *self.watcher.lock().unwrap() = None;
        self.wait_for_index();
        self.saver.flush();
        self.saver.shutdown();
    }

    /// Where this engine persists its index.
    pub fn save_path(&self) -> &PathBuf {
        &self.save_path
    }

    // -----------------------------------------------------------------------
    // Background machinery
    // -----------------------------------------------------------------------

    fn spawn_indexing(&self) {
        let cancel = CancelToken::new();
        *self.index_cancel.lock().unwrap() = cancel.clone();

        let state = Arc::clone(&self.state);
        let collab = Arc::clone(&self.collab);
        let extractor = Arc::clone(&self.extractor);
        let file_cache = Arc::clone(&self.file_cache);
        let saver = Arc::clone(&self.saver);
        let handle = std::thread::spawn(move || {
            indexer::run(&state, &collab, &extractor, &file_cache, &saver, &cancel);
        });
        *self.index_handle.lock().unwrap() = Some(handle);
    }

    /// Periodic memory estimate: soft pressure shrinks caches, hard pressure
    /// halts progressive indexing and clears everything cacheable.
    fn spawn_memory_monitor(&self) {
        let state = Arc::clone(&self.state);
        let collab = Arc::clone(&self.collab);
        let file_cache = Arc::clone(&self.file_cache);
        let token_cache = Arc::clone(&self.token_cache);
        let cancel = self.monitor_cancel.clone();
        let index_cancel = Arc::clone(&self.index_cancel);

        std::thread::spawn(move || loop {
            for _ in 0..MEMORY_CHECK_INTERVAL_SECS {
                if cancel.is_cancelled() {
                    return;
                }
                std::thread::sleep(Duration::from_secs(1));
            }

            let estimate = {
                let s = state.read().unwrap();
                s.store.memory_estimate() + s.stats.memory_estimate()
            } + file_cache.memory_estimate();

            if estimate > MEMORY_HARD_LIMIT_BYTES {
                warn!(estimate, "Hard memory limit exceeded, halting indexing");
                index_cancel.lock().unwrap().cancel();
                let mut s = state.write().unwrap();
                s.indexing_halted = true;
                s.caches.clear();
                drop(s);
                file_cache.clear();
                token_cache.clear();
                collab.notify_warn("Code index paused: memory limit reached");
            } else if estimate > MEMORY_SOFT_LIMIT_BYTES {
                let mut s = state.write().unwrap();
                s.caches.shrink();
                drop(s);
                file_cache.clear();
            }
        });
    }

    // -----------------------------------------------------------------------
    // Internal handles for in-crate tests
    // -----------------------------------------------------------------------

    pub(crate) fn state_handle(&self) -> Arc<RwLock<EngineState>> {
        Arc::clone(&self.state)
    }

    pub(crate) fn file_cache_handle(&self) -> Arc<FileCache> {
        Arc::clone(&self.file_cache)
    }

    pub(crate) fn saver_handle(&self) -> Arc<SaveScheduler> {
        Arc::clone(&self.saver)
    }

    pub(crate) fn collaborators_handle(&self) -> Arc<Collaborators> {
        Arc::clone(&self.collab)
    }

    pub(crate) fn extractor_handle(&self) -> Arc<Extractor> {
        Arc::clone(&self.extractor)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
