//! On-disk persistence: versioned JSON load/save, legacy-format migration,
//! chunked loading, and the debounced save scheduler.
//!
//! The index lives in one file per workspace under the per-user data
//! directory. A legacy unversioned array form, and a legacy location inside
//! the workspace itself, are both recognized and migrated on load. A corrupt
//! file is never deleted preemptively; it is overwritten by the next save.

use crate::services::FileSystem;
use crate::types::{
    epoch_ms, IndexEntry, IndexMetadata, INDEX_VERSION, LOAD_CHUNK_SIZE, SAVE_DEBOUNCE_MS,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("index I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("index file is corrupt: {0}")]
    Corrupt(String),
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Application data directory (`~/.local/share/coderag` or the platform
/// equivalent).
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("coderag"))
}

/// Canonical index file for a workspace.
pub fn index_path(workspace_id: &str) -> Option<PathBuf> {
    data_dir().map(|d| d.join("index").join(format!("{workspace_id}.json")))
}

/// Legacy location inside the workspace itself.
pub fn legacy_index_path(root: &Path) -> PathBuf {
    root.join(".coderag").join("index.json")
}

// ---------------------------------------------------------------------------
// Serialized shape
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct IndexFile {
    metadata: IndexMetadata,
    #[serde(default)]
    entries: Vec<IndexEntry>,
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    metadata: &'a IndexMetadata,
    entries: Vec<&'a IndexEntry>,
}

/// A loaded index, with `migrated` set when the source was a legacy format or
/// location and should be rewritten in the canonical shape.
pub struct LoadedIndex {
    pub metadata: IndexMetadata,
    pub entries: Vec<IndexEntry>,
    pub migrated: bool,
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load the persisted index from `primary`, falling back to the legacy
/// location under `root`. `Ok(None)` means no file exists anywhere;
/// `Err(Corrupt)` means a file exists but cannot be parsed.
pub fn load(
    fs: &dyn FileSystem,
    primary: &Path,
    root: &Path,
) -> Result<Option<LoadedIndex>, PersistError> {
    let legacy = legacy_index_path(root);

    let (content, from_legacy_path) = match fs.read_to_string(primary) {
        Ok(content) => (content, false),
        Err(_) => match fs.read_to_string(&legacy) {
            Ok(content) => (content, true),
            Err(_) => return Ok(None),
        },
    };

    let (metadata, entries, legacy_format) = parse_index(&content)?;
    let mut loaded = LoadedIndex {
        metadata,
        entries,
        migrated: legacy_format || from_legacy_path,
    };

    // Finalize entries in chunks, yielding between chunks so a large index
    // does not monopolize the scheduler.
    for chunk in loaded.entries.chunks_mut(LOAD_CHUNK_SIZE) {
        for entry in chunk.iter_mut() {
            if entry.token_sets_missing() {
                entry.rebuild_token_sets();
            }
        }
        std::thread::yield_now();
    }

    if loaded.metadata.version != INDEX_VERSION {
        info!(
            found = loaded.metadata.version.as_str(),
            expected = INDEX_VERSION,
            "Index schema version differs, scheduling rebuild"
        );
        loaded.metadata.needs_rebuild = true;
    }
    if loaded.migrated {
        debug!(entries = loaded.entries.len(), "Migrated legacy index format");
    }

    Ok(Some(loaded))
}

/// Detect the on-disk shape: the versioned `{metadata, entries}` object, or
/// the legacy bare entry array.
fn parse_index(content: &str) -> Result<(IndexMetadata, Vec<IndexEntry>, bool), PersistError> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| PersistError::Corrupt(e.to_string()))?;

    if value.is_array() {
        let entries: Vec<IndexEntry> =
            serde_json::from_value(value).map_err(|e| PersistError::Corrupt(e.to_string()))?;
        let metadata = IndexMetadata {
            version: INDEX_VERSION.to_string(),
            file_count: entries.len(),
            last_updated: epoch_ms(),
            ..Default::default()
        };
        return Ok((metadata, entries, true));
    }

    let file: IndexFile =
        serde_json::from_value(value).map_err(|e| PersistError::Corrupt(e.to_string()))?;
    Ok((file.metadata, file.entries, false))
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Write the whole index to `path`, creating the parent directory and stamping
/// the metadata timestamps and counters.
pub fn save<'a>(
    fs: &dyn FileSystem,
    path: &Path,
    metadata: &mut IndexMetadata,
    entries: impl IntoIterator<Item = &'a IndexEntry>,
) -> Result<(), PersistError> {
    let entries: Vec<&IndexEntry> = entries.into_iter().collect();
    metadata.version = INDEX_VERSION.to_string();
    metadata.file_count = entries.len();
    metadata.last_updated = epoch_ms();

    let body = serde_json::to_string(&IndexFileRef { metadata, entries })
        .map_err(|e| PersistError::Corrupt(e.to_string()))?;
    metadata.total_size = Some(body.len() as f64 / (1024.0 * 1024.0));

    if let Some(parent) = path.parent() {
        fs.create_dir_all(parent)?;
    }
    fs.write(path, body.as_bytes())?;
    debug!(path = %path.display(), entries = metadata.file_count, "Index saved");
    Ok(())
}

// ---------------------------------------------------------------------------
// Debounced save scheduler
// ---------------------------------------------------------------------------

enum SaveMessage {
    Touch,
    Flush(mpsc::Sender<()>),
    Shutdown,
}

/// Debounces save requests: a save runs once the index has been quiet for the
/// debounce window. `flush` forces a pending save through synchronously.
pub struct SaveScheduler {
    tx: mpsc::Sender<SaveMessage>,
    handle: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SaveScheduler {
    pub fn start<F>(save: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<SaveMessage>();
        let handle = std::thread::spawn(move || {
            let debounce = Duration::from_millis(SAVE_DEBOUNCE_MS);
            let mut dirty_since: Option<Instant> = None;
            loop {
                match rx.recv_timeout(Duration::from_millis(250)) {
                    Ok(SaveMessage::Touch) => {
                        dirty_since = Some(Instant::now());
                    }
                    Ok(SaveMessage::Flush(ack)) => {
                        if dirty_since.take().is_some() {
                            save();
                        }
                        let _ = ack.send(());
                    }
                    Ok(SaveMessage::Shutdown) => {
                        if dirty_since.take().is_some() {
                            save();
                        }
                        break;
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if dirty_since.is_some_and(|t| t.elapsed() >= debounce) {
                            dirty_since = None;
                            save();
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        if dirty_since.take().is_some() {
                            save();
                        }
                        break;
                    }
                }
            }
        });
        Self { tx, handle: std::sync::Mutex::new(Some(handle)) }
    }

    /// Mark the index dirty; the save fires after the debounce window.
    pub fn schedule(&self) {
        let _ = self.tx.send(SaveMessage::Touch);
    }

    /// Run any pending save now and wait for it.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(SaveMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(Duration::from_secs(30));
        }
    }

    /// Stop the scheduler, saving once more if dirty.
    pub fn shutdown(&self) {
        let _ = self.tx.send(SaveMessage::Shutdown);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if handle.join().is_err() {
                warn!("Save scheduler thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SaveScheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(SaveMessage::Shutdown);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
