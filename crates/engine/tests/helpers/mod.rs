//! Test harness for engine integration tests.
//!
//! Builds a `RetrievalEngine` over fixture files copied into a temp dir, with
//! the index file kept in a sibling temp directory so tests never touch the
//! real application data dir.

pub mod fixtures;

use coderag_engine::types::EngineConfig;
use coderag_engine::{Collaborators, RetrievalEngine};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TestHarness {
    pub engine: RetrievalEngine,
    pub root: PathBuf,
    pub index_dir: PathBuf,
    temp_dir: TempDir,
}

impl TestHarness {
    /// Create a harness from a named fixture directory, with default
    /// collaborators and a warmed, fully built index.
    pub fn from_fixture(name: &str) -> Self {
        Self::build(Some(name), EngineConfig::default(), Collaborators::default(), true)
    }

    /// Create a harness over an empty workspace.
    pub fn empty() -> Self {
        Self::build(None, EngineConfig::default(), Collaborators::default(), true)
    }

    /// Full control over config and collaborators. `warm` builds the index
    /// synchronously before returning.
    pub fn build(
        fixture: Option<&str>,
        mut config: EngineConfig,
        collab: Collaborators,
        warm: bool,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("ws");
        std::fs::create_dir_all(&root).expect("Failed to create workspace dir");
        // Watcher events carry canonical paths; match them.
        let root = root.canonicalize().expect("Failed to canonicalize workspace dir");
        let index_dir = temp_dir.path().join("idx");

        if let Some(name) = fixture {
            let fixture_src =
                Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
            assert!(
                fixture_src.exists(),
                "Fixture '{name}' not found at {}",
                fixture_src.display()
            );
            fixtures::copy_dir_recursive(&fixture_src, &root);
        }

        config.index_dir = Some(index_dir.clone());
        let engine = RetrievalEngine::with_config(root.clone(), config, collab);
        if warm {
            engine.warm_index();
            engine.wait_for_index();
        }

        TestHarness { engine, root, index_dir, temp_dir }
    }

    /// Write (or overwrite) a file inside the workspace.
    pub fn write_file(&self, rel_path: &str, content: &str) {
        let path = self.root.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    /// Dispose the current engine (flushing its index to disk) and open a
    /// fresh one over the same workspace and index directory.
    pub fn reopen(self) -> Self {
        self.engine.dispose();
        let TestHarness { root, index_dir, temp_dir, .. } = self;
        let config =
            EngineConfig { index_dir: Some(index_dir.clone()), ..Default::default() };
        let engine = RetrievalEngine::with_config(root.clone(), config, Collaborators::default());
        engine.warm_index();
        engine.wait_for_index();
        TestHarness { engine, root, index_dir, temp_dir }
    }

    /// Path of the persisted index file.
    pub fn index_file(&self) -> PathBuf {
        self.engine.save_path().clone()
    }
}
