//! Collaborator traits consumed by the engine.
//!
//! The engine never implements these beyond the `StdFs` adapter; hosts supply
//! them as trait objects at construction. Optional services are held as
//! `Option<Arc<dyn Trait>>` and every call site checks presence before use, so
//! a missing or failing collaborator always degrades to the baseline strategy
//! instead of surfacing an error.

use crate::types::CancelToken;
use std::io;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// File system
// ---------------------------------------------------------------------------

/// Stat result for a single path.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    /// Milliseconds since the Unix epoch; 0 when unavailable.
    pub modified_ms: u64,
    pub is_dir: bool,
}

/// One child of a listed directory.
#[derive(Debug, Clone)]
pub struct DirChild {
    pub name: String,
    pub is_dir: bool,
    pub modified_ms: u64,
}

/// Point reads and writes. Recursive walking and watching stay on the
/// `ignore`/`notify` stack inside the indexer and watcher modules.
pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn stat(&self, path: &Path) -> io::Result<FileStat>;
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirChild>>;
}

/// Default adapter over `std::fs`.
pub struct StdFs;

fn modified_ms(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl FileSystem for StdFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = std::fs::metadata(path)?;
        Ok(FileStat {
            size: metadata.len(),
            modified_ms: modified_ms(&metadata),
            is_dir: metadata.is_dir(),
        })
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirChild>> {
        let mut children = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            children.push(DirChild {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: metadata.is_dir(),
                modified_ms: modified_ms(&metadata),
            });
        }
        Ok(children)
    }
}

// ---------------------------------------------------------------------------
// Host services
// ---------------------------------------------------------------------------

/// Short user-visible messages. Only rebuild lifecycle events and unrecoverable
/// degradation go through here.
pub trait NotificationService: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
}

/// Identity of the workspace being indexed.
pub trait WorkspaceContext: Send + Sync {
    fn workspace_id(&self) -> String;
    fn root_uris(&self) -> Vec<PathBuf>;
}

// ---------------------------------------------------------------------------
// AST service
// ---------------------------------------------------------------------------

/// A declared symbol with its location; children hold nested declarations.
#[derive(Debug, Clone, Default)]
pub struct SymbolNode {
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
    pub children: Vec<SymbolNode>,
}

/// A syntax-bounded chunk produced by the AST collaborator.
#[derive(Debug, Clone)]
pub struct AstChunk {
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
}

pub trait AstService: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn extract_symbols(&self, uri: &str, text: &str) -> Result<Vec<SymbolNode>, String>;
    fn create_ast_chunks(
        &self,
        uri: &str,
        text: &str,
        symbols: &[SymbolNode],
    ) -> Result<Vec<AstChunk>, String>;
}

// ---------------------------------------------------------------------------
// Embedding, secrets, privacy
// ---------------------------------------------------------------------------

pub trait EmbeddingService: Send + Sync {
    fn is_enabled(&self) -> bool;
    /// Embed a batch of texts. Implementations may return one vector per text,
    /// or a single flat vector for the whole batch; the engine normalizes both.
    fn embed(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>, String>;
}

/// Result of scanning a text for secrets.
#[derive(Debug, Clone)]
pub struct SecretScan {
    pub has_secrets: bool,
    pub redacted_text: String,
}

pub trait SecretDetectionService: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn detect_secrets(&self, text: &str) -> SecretScan;
}

pub trait PrivacyGate: Send + Sync {
    fn is_offline_or_privacy_mode(&self) -> bool;
}

// ---------------------------------------------------------------------------
// External vector store
// ---------------------------------------------------------------------------

/// A scored hit from the external vector store. Document ids are either a
/// bare `uri` or `uri:chunk_index`.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
}

pub trait VectorStore: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorHit>, String>;
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

use std::sync::Arc;

/// Everything the host wires in at construction. Collaborators are plain trait
/// objects; the engine holds no back-references into the host beyond these.
#[derive(Clone)]
pub struct Collaborators {
    pub fs: Arc<dyn FileSystem>,
    pub notifications: Option<Arc<dyn NotificationService>>,
    pub workspace: Option<Arc<dyn WorkspaceContext>>,
    pub ast: Option<Arc<dyn AstService>>,
    pub embeddings: Option<Arc<dyn EmbeddingService>>,
    pub secrets: Option<Arc<dyn SecretDetectionService>>,
    pub privacy: Option<Arc<dyn PrivacyGate>>,
    pub vectors: Option<Arc<dyn VectorStore>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            fs: Arc::new(StdFs),
            notifications: None,
            workspace: None,
            ast: None,
            embeddings: None,
            secrets: None,
            privacy: None,
            vectors: None,
        }
    }
}

impl Collaborators {
    pub fn notify_info(&self, message: &str) {
        if let Some(n) = &self.notifications {
            n.info(message);
        }
    }

    pub fn notify_warn(&self, message: &str) {
        if let Some(n) = &self.notifications {
            n.warn(message);
        }
    }
}
