//! Memoisation over expensive extraction calls.
//!
//! - `ExtractionCache`: `compute_or_fetch` keyed by a hash of the call inputs
//! - `HashIndex`: upstream hash → derived hash side tables
//!
//! Entries are never expired. Changing what a step extracts means changing
//! its namespace (`.../schema_v12`), which starts an empty cache.

pub mod hash_index;

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::storage::{StepStore, StorageError};

pub use hash_index::HashIndex;

/// How much of the document content feeds the cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CacheKeyMode {
    /// Hash the whole document
    Full,

    /// Hash only the first `chars` characters. Two documents sharing that
    /// prefix share a cache entry.
    Prefix { chars: usize },
}

impl Default for CacheKeyMode {
    fn default() -> Self {
        Self::Full
    }
}

/// Hex SHA-256 over the canonical JSON of the significant call inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for `(content, context)`.
    ///
    /// The context is hashed in its `serde_json::Value` form, whose object
    /// keys are sorted, so field order in the caller's structs does not matter.
    pub fn derive(content: &str, context: &serde_json::Value, mode: CacheKeyMode) -> Self {
        let (mode_tag, content) = match mode {
            CacheKeyMode::Full => ("full".to_string(), content.to_string()),
            CacheKeyMode::Prefix { chars } => (
                format!("prefix:{}", chars),
                content.chars().take(chars).collect(),
            ),
        };

        let canonical = serde_json::json!([
            { "mode": mode_tag },
            { "content": content },
            { "context": context },
        ]);

        Self(hex::encode(Sha256::digest(canonical.to_string().as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the entry within its namespace
    pub fn file_name(&self) -> String {
        format!("cache_{}.json", self.0)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value together with whether it came from the cache
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub hit: bool,
}

/// Extraction results persisted in the step store under a namespace
#[derive(Clone)]
pub struct ExtractionCache {
    store: StepStore,
}

impl ExtractionCache {
    pub fn new(store: StepStore) -> Self {
        Self { store }
    }

    /// Cached value for `key`, if any. Unreadable entries count as misses.
    pub async fn lookup<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &CacheKey,
    ) -> Result<Option<T>, StorageError> {
        match self.store.read_json::<T>(namespace, &key.file_name()).await {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e @ (StorageError::Json { .. } | StorageError::Utf8 { .. })) => {
                warn!(namespace, key = %key, error = %e, "Ignoring unreadable cache entry");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn contains(&self, namespace: &str, key: &CacheKey) -> Result<bool, StorageError> {
        self.store.exists(namespace, &key.file_name()).await
    }

    /// Return the cached value for `key`, or run `compute` and cache its result.
    ///
    /// Nothing is written when `compute` fails; the error is returned as-is
    /// and the next call with the same key computes again.
    pub async fn compute_or_fetch<T, E, F, Fut>(
        &self,
        namespace: &str,
        key: &CacheKey,
        compute: F,
    ) -> Result<Fetched<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StorageError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup::<T>(namespace, key).await? {
            debug!(namespace, key = %key, "cache hit");
            return Ok(Fetched { value, hit: true });
        }

        let value = compute().await?;
        self.store
            .write_json(namespace, &key.file_name(), &value)
            .await?;
        debug!(namespace, key = %key, "cache store");

        Ok(Fetched { value, hit: false })
    }
}
