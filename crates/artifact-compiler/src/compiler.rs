//! Artifact Compiler Implementation

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::descriptor::{CompiledArtifact, ModelDescriptor};
use crate::store::ArtifactStore;
use crate::CompileError;

/// Backend that turns a source model into device-specific artifact bytes
pub trait ModelBuilder: Send + Sync {
    /// Architecture tag baked into artifact names (e.g. "cpu-x86_64")
    fn device_arch(&self) -> &str;

    /// Build the artifact. `Err` carries the backend's diagnostics.
    fn build(&self, descriptor: &ModelDescriptor, source: &[u8]) -> Result<Vec<u8>, String>;
}

/// Build-once artifact cache
pub struct ArtifactCompiler<S, B> {
    cache_dir: PathBuf,
    store: S,
    builder: B,
    /// One exclusion per descriptor; different descriptors never wait on each other
    locks: Mutex<HashMap<ModelDescriptor, Arc<Mutex<()>>>>,
}

impl<S: ArtifactStore, B: ModelBuilder> ArtifactCompiler<S, B> {
    pub fn new(cache_dir: impl Into<PathBuf>, store: S, builder: B) -> Self {
        let cache_dir = cache_dir.into();
        info!(
            "Creating artifact compiler: cache_dir={}, arch={}",
            cache_dir.display(),
            builder.device_arch()
        );
        Self {
            cache_dir,
            store,
            builder,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Final artifact location for `descriptor`
    pub fn artifact_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.cache_dir
            .join(descriptor.artifact_file_name(self.builder.device_arch()))
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Ensure an artifact exists for `descriptor`, building it if needed
    pub fn compile(&self, descriptor: &ModelDescriptor) -> Result<CompiledArtifact, CompileError> {
        self.validate(descriptor)?;
        let path = self.artifact_path(descriptor);

        if self.store.artifact_exists(&path) {
            return Ok(self.cache_hit(descriptor, path));
        }

        let lock = self.lock_for(descriptor);
        let _guard = lock.lock();

        // Another caller may have finished the build while we waited
        if self.store.artifact_exists(&path) {
            return Ok(self.cache_hit(descriptor, path));
        }

        if !self.store.source_exists(&descriptor.source_path) {
            error!(
                "Source model for {} missing: {}",
                descriptor.name,
                descriptor.source_path.display()
            );
            return Err(CompileError::MissingSourceModel {
                name: descriptor.name.clone(),
                path: descriptor.source_path.clone(),
            });
        }

        let source = self.store.read_source(&descriptor.source_path)?;

        info!(
            "Building {} ({}, max_batch={}, dynamic_batch={}) -> {}",
            descriptor.name,
            descriptor.precision.as_str(),
            descriptor.max_batch_size,
            descriptor.dynamic_batch,
            path.display()
        );
        let start = Instant::now();

        let bytes = self.builder.build(descriptor, &source).map_err(|diagnostics| {
            error!("Build failed for {}: {}", descriptor.name, diagnostics);
            CompileError::BackendBuild {
                name: descriptor.name.clone(),
                diagnostics,
            }
        })?;

        self.store.publish(&path, &bytes)?;
        metrics::counter!("artifact_builds_total", "model" => descriptor.name.clone())
            .increment(1);
        info!(
            "Built {} in {:?} ({} bytes)",
            descriptor.name,
            start.elapsed(),
            bytes.len()
        );

        Ok(CompiledArtifact {
            path,
            descriptor: descriptor.clone(),
        })
    }

    /// Compile a startup set in order, stopping at the first failure
    pub fn compile_all(
        &self,
        descriptors: &[ModelDescriptor],
    ) -> Result<Vec<CompiledArtifact>, CompileError> {
        descriptors.iter().map(|d| self.compile(d)).collect()
    }

    /// Artifact names must stay inside the cache directory
    fn validate(&self, descriptor: &ModelDescriptor) -> Result<(), CompileError> {
        let arch = self.builder.device_arch();
        let reason = match descriptor.validate() {
            Err(reason) => Some(reason),
            Ok(()) if arch.is_empty() || arch.contains(['/', '\\']) || arch.contains("..") => {
                Some(format!("device arch {:?} is not usable in a file name", arch))
            }
            Ok(()) => None,
        };
        match reason {
            Some(reason) => {
                error!("Rejecting descriptor {:?}: {}", descriptor.name, reason);
                Err(CompileError::InvalidDescriptor {
                    name: descriptor.name.clone(),
                    reason,
                })
            }
            None => Ok(()),
        }
    }

    fn lock_for(&self, descriptor: &ModelDescriptor) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(descriptor.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cache_hit(&self, descriptor: &ModelDescriptor, path: PathBuf) -> CompiledArtifact {
        debug!("Artifact cache hit for {}: {}", descriptor.name, path.display());
        metrics::counter!("artifact_cache_hits_total", "model" => descriptor.name.clone())
            .increment(1);
        CompiledArtifact {
            path,
            descriptor: descriptor.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};
    use std::time::Duration;

    struct CountingBuilder {
        builds: AtomicUsize,
        delay: Duration,
        fail_with: Option<String>,
    }

    impl CountingBuilder {
        fn new() -> Self {
            Self {
                builds: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail_with: None,
            }
        }

        fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }
    }

    impl ModelBuilder for CountingBuilder {
        fn device_arch(&self) -> &str {
            "test-arch"
        }

        fn build(&self, descriptor: &ModelDescriptor, source: &[u8]) -> Result<Vec<u8>, String> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            match &self.fail_with {
                Some(msg) => Err(msg.clone()),
                None => {
                    let mut out = descriptor.name.as_bytes().to_vec();
                    out.extend_from_slice(source);
                    Ok(out)
                }
            }
        }
    }

    /// Holds the build of one model until released; every other model builds at once
    struct GatedBuilder {
        gated: String,
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl ModelBuilder for GatedBuilder {
        fn device_arch(&self) -> &str {
            "test-arch"
        }

        fn build(&self, descriptor: &ModelDescriptor, source: &[u8]) -> Result<Vec<u8>, String> {
            if descriptor.name == self.gated {
                let _ = self.started.lock().send(());
                self.release
                    .lock()
                    .recv_timeout(Duration::from_secs(5))
                    .map_err(|_| "gate never released".to_string())?;
            }
            Ok(source.to_vec())
        }
    }

    fn descriptor(name: &str) -> ModelDescriptor {
        ModelDescriptor::new(name, format!("models/{}.onnx", name))
    }

    fn store_with(names: &[&str]) -> MemoryArtifactStore {
        names.iter().fold(MemoryArtifactStore::new(), |store, name| {
            store.with_source(format!("models/{}.onnx", name), b"onnx".to_vec())
        })
    }

    #[test]
    fn test_second_compile_is_a_cache_hit() {
        let compiler =
            ArtifactCompiler::new("cache", store_with(&["yolox_m"]), CountingBuilder::new());
        let d = descriptor("yolox_m");

        let first = compiler.compile(&d).unwrap();
        assert_eq!(compiler.builder.builds(), 1);

        let second = compiler.compile(&d).unwrap();
        assert_eq!(compiler.builder.builds(), 1);
        assert_eq!(first.path, second.path);
        assert_eq!(
            compiler.store().artifact(&first.path).unwrap(),
            b"yolox_monnx".to_vec()
        );
    }

    #[test]
    fn test_existing_artifact_needs_no_source() {
        let store = MemoryArtifactStore::new();
        let compiler = ArtifactCompiler::new("cache", store, CountingBuilder::new());
        let d = descriptor("sppe");
        let path = compiler.artifact_path(&d);
        compiler.store().insert_artifact(path.clone(), b"prebuilt".to_vec());

        let artifact = compiler.compile(&d).unwrap();
        assert_eq!(artifact.path, path);
        assert_eq!(compiler.builder.builds(), 0);
    }

    #[test]
    fn test_missing_source_model() {
        let compiler =
            ArtifactCompiler::new("cache", MemoryArtifactStore::new(), CountingBuilder::new());
        let err = compiler.compile(&descriptor("gcn")).unwrap_err();
        assert!(matches!(err, CompileError::MissingSourceModel { ref name, .. } if name == "gcn"));
        assert_eq!(compiler.builder.builds(), 0);
    }

    #[test]
    fn test_build_failure_carries_diagnostics_and_publishes_nothing() {
        let builder = CountingBuilder {
            fail_with: Some("unsupported op Foo".into()),
            ..CountingBuilder::new()
        };
        let compiler = ArtifactCompiler::new("cache", store_with(&["gcn"]), builder);

        let err = compiler.compile(&descriptor("gcn")).unwrap_err();
        match err {
            CompileError::BackendBuild { diagnostics, .. } => {
                assert!(diagnostics.contains("unsupported op Foo"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(compiler.store().artifact_count(), 0);
    }

    #[test]
    fn test_concurrent_compiles_build_once() {
        let builder = CountingBuilder {
            delay: Duration::from_millis(50),
            ..CountingBuilder::new()
        };
        let compiler = ArtifactCompiler::new("cache", store_with(&["yolox_m"]), builder);
        let d = descriptor("yolox_m");
        let callers = 8;
        let barrier = Barrier::new(callers);

        let paths: Vec<PathBuf> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..callers)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        compiler.compile(&d).map(|a| a.path)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect()
        });

        assert_eq!(compiler.builder.builds(), 1);
        assert!(paths.iter().all(|p| *p == paths[0]));
    }

    #[test]
    fn test_different_descriptors_build_independently() {
        let compiler = ArtifactCompiler::new(
            "cache",
            store_with(&["yolox_m", "sppe", "gcn"]),
            CountingBuilder::new(),
        );
        let all = [descriptor("yolox_m"), descriptor("sppe"), descriptor("gcn")];

        let artifacts = compiler.compile_all(&all).unwrap();
        assert_eq!(artifacts.len(), 3);
        assert_eq!(compiler.builder.builds(), 3);
        assert_eq!(compiler.store().artifact_count(), 3);
    }

    #[test]
    fn test_build_in_progress_does_not_block_other_descriptors() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let builder = GatedBuilder {
            gated: "yolox_m".into(),
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        };
        let compiler = ArtifactCompiler::new("cache", store_with(&["yolox_m", "sppe"]), builder);
        let slow = descriptor("yolox_m");
        let fast = descriptor("sppe");

        std::thread::scope(|s| {
            let held = s.spawn(|| compiler.compile(&slow));
            started_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("gated build never started");

            // yolox_m is still inside its build while sppe compiles
            let artifact = compiler.compile(&fast).unwrap();
            assert!(!held.is_finished());
            assert!(compiler.store().artifact(&artifact.path).is_some());

            release_tx.send(()).unwrap();
            held.join().unwrap().unwrap();
        });

        assert_eq!(compiler.store().artifact_count(), 2);
    }

    #[test]
    fn test_invalid_name_rejected_before_touching_storage() {
        let compiler = ArtifactCompiler::new(
            "cache",
            store_with(&["../escape", "a/b"]),
            CountingBuilder::new(),
        );
        for name in ["../escape", "a/b"] {
            let err = compiler.compile(&descriptor(name)).unwrap_err();
            assert!(matches!(err, CompileError::InvalidDescriptor { .. }), "{name}");
        }
        assert_eq!(compiler.builder.builds(), 0);
        assert_eq!(compiler.store().artifact_count(), 0);
    }

    #[test]
    fn test_compile_all_stops_at_first_failure() {
        let compiler = ArtifactCompiler::new(
            "cache",
            store_with(&["yolox_m", "gcn"]),
            CountingBuilder::new(),
        );
        let all = [descriptor("yolox_m"), descriptor("sppe"), descriptor("gcn")];

        let err = compiler.compile_all(&all).unwrap_err();
        assert!(matches!(err, CompileError::MissingSourceModel { ref name, .. } if name == "sppe"));
        assert_eq!(compiler.builder.builds(), 1);
    }

    #[test]
    fn test_fs_store_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("yolox_m.onnx");
        std::fs::write(&source, b"onnx").unwrap();

        let compiler = ArtifactCompiler::new(
            dir.path().join("cache"),
            crate::FsArtifactStore::new(),
            CountingBuilder::new(),
        );
        let d = ModelDescriptor::new("yolox_m", &source);

        let artifact = compiler.compile(&d).unwrap();
        assert!(artifact.path.is_file());
        assert!(artifact.path.starts_with(dir.path().join("cache")));
        compiler.compile(&d).unwrap();
        assert_eq!(compiler.builder.builds(), 1);
    }
}
