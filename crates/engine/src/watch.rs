//! File watcher for incremental live re-indexing.
//!
//! Watches the workspace root recursively. Deletions are applied to every
//! index and cache as soon as the event arrives; creates and modifies are
//! coalesced into a pending set and processed in parallel batches after a
//! debounce window of quiet, reusing each file's existing arena slot through
//! the path index.

use crate::engine::EngineState;
use crate::extract::{Extractor, FileCache};
use crate::persist::SaveScheduler;
use crate::query::rebuild_common_pools;
use crate::services::Collaborators;
use crate::types::{CancelToken, IndexEntry, WATCH_DEBOUNCE_MS};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Start watching the workspace root. Returns the watcher handle; dropping it
/// stops the watcher.
pub fn start_watcher(
    state: Arc<RwLock<EngineState>>,
    collab: Arc<Collaborators>,
    extractor: Arc<Extractor>,
    file_cache: Arc<FileCache>,
    saver: Arc<SaveScheduler>,
    cancel: CancelToken,
) -> Option<RecommendedWatcher> {
    let (tx, rx) = mpsc::channel::<Event>();

    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "Failed to create file watcher");
            return None;
        }
    };

    let root = state.read().unwrap().root.clone();
    if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
        warn!(root = %root.display(), error = %e, "Failed to watch workspace");
        return None;
    }
    info!(root = %root.display(), "Watching workspace");

    std::thread::spawn(move || {
        debounce_loop(rx, state, collab, extractor, file_cache, saver, cancel);
    });

    Some(watcher)
}

/// Collect events, apply deletions immediately, and process the pending set
/// after the debounce window of quiet.
fn debounce_loop(
    rx: mpsc::Receiver<Event>,
    state: Arc<RwLock<EngineState>>,
    collab: Arc<Collaborators>,
    extractor: Arc<Extractor>,
    file_cache: Arc<FileCache>,
    saver: Arc<SaveScheduler>,
    cancel: CancelToken,
) {
    let root = state.read().unwrap().root.clone();
    let mut pending: HashSet<String> = HashSet::new();
    let mut last_event = Instant::now();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                for path in &event.paths {
                    route_event(path, &root, &state, &file_cache, &saver, &mut pending);
                }
                last_event = Instant::now();
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty()
                    || last_event.elapsed() < Duration::from_millis(WATCH_DEBOUNCE_MS)
                {
                    continue;
                }
                let batch: Vec<String> = pending.drain().collect();
                process_pending(batch, &root, &state, &collab, &extractor, &file_cache, &cancel);
                saver.schedule();
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Classify one event path: ignore, delete immediately, or queue for update.
fn route_event(
    abs_path: &Path,
    root: &Path,
    state: &Arc<RwLock<EngineState>>,
    file_cache: &FileCache,
    saver: &Arc<SaveScheduler>,
    pending: &mut HashSet<String>,
) {
    let rel_path = match abs_path.strip_prefix(root) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => return,
    };
    if rel_path.is_empty() || abs_path.is_dir() {
        return;
    }

    {
        let s = state.read().unwrap();
        if s.config.is_excluded_path(&rel_path) || !s.config.accepts(&rel_path) {
            return;
        }
    }

    if abs_path.exists() {
        file_cache.invalidate(&rel_path);
        pending.insert(rel_path);
    } else {
        // Deletion: applied immediately to every index and cache.
        pending.remove(&rel_path);
        file_cache.invalidate(&rel_path);
        let mut s = state.write().unwrap();
        if let Some(index) = s.store.index_of(&rel_path) {
            s.store.remove(index);
            s.stats.remove(index);
            s.caches.results.clear();
            let pools = rebuild_common_pools(&s.store);
            s.common_pools = pools;
            s.metadata.file_count = s.store.len();
            s.metadata.last_updated = crate::types::epoch_ms();
            drop(s);
            debug!(uri = rel_path.as_str(), "Removed deleted file from index");
            saver.schedule();
        }
    }
}

/// Re-extract a batch of pending URIs in parallel and swap the results into
/// the store, reusing existing slots via the path index.
fn process_pending(
    mut batch: Vec<String>,
    root: &Path,
    state: &Arc<RwLock<EngineState>>,
    collab: &Arc<Collaborators>,
    extractor: &Arc<Extractor>,
    file_cache: &Arc<FileCache>,
    cancel: &CancelToken,
) {
    batch.sort();
    let config = state.read().unwrap().config.clone();
    let workers = config.indexer_parallelism.clamp(1, batch.len().max(1));
    let group_size = batch.len().div_ceil(workers);
    let config_ref = &config;

    let extracted: Vec<IndexEntry> = std::thread::scope(|scope| {
        let handles: Vec<_> = batch
            .chunks(group_size.max(1))
            .map(|group| {
                scope.spawn(move || {
                    let mut entries = Vec::with_capacity(group.len());
                    for rel_path in group {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let abs_path = root.join(rel_path);
                        if let Some(entry) = extractor.extract_entry(
                            rel_path,
                            &abs_path,
                            config_ref,
                            collab,
                            file_cache,
                            cancel,
                        ) {
                            entries.push(entry);
                        }
                    }
                    entries
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap_or_default()).collect()
    });

    if extracted.is_empty() {
        return;
    }

    let mut s = state.write().unwrap();
    let updated = extracted.len();
    for entry in extracted {
        let snippet = entry.snippet.clone();
        let index = s.store.add(entry);
        s.stats.upsert(index, &snippet);
    }
    s.caches.results.clear();
    let pools = rebuild_common_pools(&s.store);
    s.common_pools = pools;
    s.metadata.file_count = s.store.len();
    s.metadata.last_updated = crate::types::epoch_ms();
    let total = s.store.len();
    drop(s);
    info!(updated, total, "Incremental index update applied");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RetrievalEngine;
    use crate::types::EngineConfig;

    fn test_workspace(dir: &tempfile::TempDir) -> (std::path::PathBuf, EngineConfig) {
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let config =
            EngineConfig { index_dir: Some(dir.path().join("idx")), ..Default::default() };
        (ws, config)
    }

    #[test]
    fn test_route_event_delete_removes_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let (root, config) = test_workspace(&dir);
        std::fs::write(root.join("a.ts"), "export function gone() {}").unwrap();

        let engine =
            RetrievalEngine::with_config(root.clone(), config, Collaborators::default());
        engine.warm_index();
        engine.wait_for_index();
        assert!(engine.index_stats().file_count >= 1);

        // Simulate the watcher seeing the deletion.
        std::fs::remove_file(root.join("a.ts")).unwrap();
        let state = engine.state_handle();
        let file_cache = engine.file_cache_handle();
        let saver = engine.saver_handle();
        let mut pending = HashSet::new();
        pending.insert("a.ts".to_string());
        route_event(&root.join("a.ts"), &root, &state, &file_cache, &saver, &mut pending);

        assert!(pending.is_empty());
        let s = state.read().unwrap();
        assert!(s.store.index_of("a.ts").is_none());
        assert!(s.store.postings_empty());
        assert!(s.stats.is_empty());
        drop(s);
        engine.dispose();
    }

    #[test]
    fn test_process_pending_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let (root, config) = test_workspace(&dir);
        std::fs::write(root.join("a.ts"), "export function before() {}").unwrap();

        let engine =
            RetrievalEngine::with_config(root.clone(), config, Collaborators::default());
        engine.warm_index();
        engine.wait_for_index();
        let state = engine.state_handle();
        let old_index = state.read().unwrap().store.index_of("a.ts").unwrap();

        std::fs::write(root.join("a.ts"), "export function after() {}").unwrap();
        engine.file_cache_handle().invalidate("a.ts");
        process_pending(
            vec!["a.ts".to_string()],
            &root,
            &state,
            &engine.collaborators_handle(),
            &engine.extractor_handle(),
            &engine.file_cache_handle(),
            &CancelToken::new(),
        );

        let s = state.read().unwrap();
        let new_index = s.store.index_of("a.ts").unwrap();
        assert_eq!(new_index, old_index);
        assert!(s.store.entry(new_index).unwrap().symbols.contains(&"after".to_string()));
        drop(s);
        engine.dispose();
    }
}
