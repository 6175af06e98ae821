//! Storage backends for source models and compiled artifacts

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Where sources are read from and artifacts are published to
pub trait ArtifactStore: Send + Sync {
    fn source_exists(&self, path: &Path) -> bool;

    fn read_source(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Existence is the only cache signal; contents are never inspected
    fn artifact_exists(&self, path: &Path) -> bool;

    /// Make `bytes` visible at `path` in one step. A crash mid-publish must
    /// not leave a partial artifact at `path`.
    fn publish(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

/// Local filesystem store
#[derive(Debug, Clone, Default)]
pub struct FsArtifactStore;

impl FsArtifactStore {
    pub fn new() -> Self {
        Self
    }
}

impl ArtifactStore for FsArtifactStore {
    fn source_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_source(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn artifact_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn publish(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        // Same directory as the target so the final rename stays on one filesystem
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        debug!("Published {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }
}

/// In-memory store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    sources: Mutex<HashMap<PathBuf, Vec<u8>>>,
    artifacts: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) -> Self {
        self.sources.lock().insert(path.into(), bytes.into());
        self
    }

    pub fn insert_artifact(&self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) {
        self.artifacts.lock().insert(path.into(), bytes.into());
    }

    pub fn artifact(&self, path: &Path) -> Option<Vec<u8>> {
        self.artifacts.lock().get(path).cloned()
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.lock().len()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn source_exists(&self, path: &Path) -> bool {
        self.sources.lock().contains_key(path)
    }

    fn read_source(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.sources
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn artifact_exists(&self, path: &Path) -> bool {
        self.artifacts.lock().contains_key(path)
    }

    fn publish(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.artifacts.lock().insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }
}
