//! Physical blob backends.
//!
//! Keys are `/`-separated relative paths (`_cas/ab/cd/abcd…`,
//! `data/recom2_scrape_products/dc-dc-converters.csv`). Backends know
//! nothing about digests or steps; the CAS and the step store build their
//! key schemes on top.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use super::error::{StorageError, StorageResult};

/// Byte storage addressed by relative keys
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Unconditional overwrite
    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Write only when nothing is stored under `key`; returns whether a write happened
    async fn write_if_absent(&self, key: &str, data: &[u8]) -> StorageResult<bool>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Names of the objects stored directly under `dir` (not recursive), sorted
    async fn list(&self, dir: &str) -> StorageResult<Vec<String>>;
}

/// Reject keys that could escape the store root
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = |reason| {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };

    if key.is_empty() {
        return invalid("empty key");
    }
    if key.starts_with('/') || key.contains('\\') {
        return invalid("keys are relative and '/'-separated");
    }
    for segment in key.split('/') {
        match segment {
            "" => return invalid("empty path segment"),
            "." | ".." => return invalid("relative path segment"),
            _ => {}
        }
    }
    Ok(())
}

/// Filesystem backend rooted at a directory
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, s| p.join(s)))
    }

    /// Write through a temporary file in the target directory, then rename
    async fn write_atomic(&self, key: &str, data: &[u8], clobber: bool) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::io(parent.display().to_string(), e))?;

        let data = data.to_vec();
        let key_owned = key.to_string();

        tokio::task::spawn_blocking(move || -> StorageResult<bool> {
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)
                .map_err(|e| StorageError::io(parent.display().to_string(), e))?;
            tmp.write_all(&data)
                .and_then(|_| tmp.as_file().sync_all())
                .map_err(|e| StorageError::io(key_owned.clone(), e))?;

            if clobber {
                tmp.persist(&path)
                    .map_err(|e| StorageError::io(key_owned, e.error))?;
                return Ok(true);
            }

            match tmp.persist_noclobber(&path) {
                Ok(_) => Ok(true),
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(StorageError::io(key_owned, e.error)),
            }
        })
        .await
        .map_err(|e| StorageError::Io {
            path: key.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(|e| StorageError::io(key, e))
    }

    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        self.write_atomic(key, data, true).await?;
        Ok(())
    }

    async fn write_if_absent(&self, key: &str, data: &[u8]) -> StorageResult<bool> {
        if self.exists(key).await? {
            return Ok(false);
        }
        self.write_atomic(key, data, false).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn list(&self, dir: &str) -> StorageResult<Vec<String>> {
        let path = self.path_for(dir)?;
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(dir, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // Leftover temporaries from an interrupted write
                if name.starts_with(".tmp") {
                    continue;
                }
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }
}

/// In-memory backend for tests and embedding.
///
/// Counts physical writes so callers can assert on write-once behaviour.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physical writes performed so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        validate_key(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), data.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_if_absent(&self, key: &str, data: &[u8]) -> StorageResult<bool> {
        validate_key(key)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            debug!(key, "object already present");
            return Ok(false);
        }
        objects.insert(key.to_string(), data.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn list(&self, dir: &str) -> StorageResult<Vec<String>> {
        validate_key(dir)?;
        let prefix = format!("{}/", dir);
        let objects = self.objects.read().await;
        Ok(objects
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(String::from)
            .collect())
    }
}
