//! Artifact storage.
//!
//! Two stores share one physical backend:
//! - `ContentStore`: immutable, write-once blobs keyed by SHA-256
//! - `StepStore`: overwritable artifacts keyed by `(step_name, file_name)`

pub mod backend;
pub mod cas;
pub mod error;
pub mod step_store;

use std::path::PathBuf;
use std::sync::Arc;

pub use backend::{BlobStore, LocalBlobStore, MemoryBlobStore};
pub use cas::{ContentDigest, ContentStore, CAS_ROOT};
pub use error::{StorageError, StorageResult};
pub use step_store::{StepStore, DATA_ROOT};

/// Both stores over one backend
#[derive(Clone)]
pub struct Storage {
    pub cas: ContentStore,
    pub steps: StepStore,
    backend: Arc<dyn BlobStore>,
}

impl Storage {
    pub fn new(backend: Arc<dyn BlobStore>) -> Self {
        Self {
            cas: ContentStore::new(backend.clone()),
            steps: StepStore::new(backend.clone()),
            backend,
        }
    }

    /// Filesystem storage rooted at `root`
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(LocalBlobStore::new(root)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobStore::new()))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}
