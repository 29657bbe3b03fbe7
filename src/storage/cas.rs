//! Content-addressed store.
//!
//! Objects are identified by the SHA-256 of their bytes and stored once at
//! `_cas/<d[0..2]>/<d[2..4]>/<digest>`. Writing identical bytes again is a
//! no-op, so concurrent writers never need a lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::backend::BlobStore;
use super::error::{StorageError, StorageResult};

/// Root prefix of every CAS object key
pub const CAS_ROOT: &str = "_cas";

/// Lowercase hex SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Digest of a byte sequence
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Accepts 64 hex characters, any case
    pub fn parse(value: &str) -> StorageResult<Self> {
        let value = value.trim();
        if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest(value.to_string()));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object key: two-level fan-out on the first four hex characters
    pub fn storage_path(&self) -> String {
        format!("{}/{}/{}/{}", CAS_ROOT, &self.0[0..2], &self.0[2..4], self.0)
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ContentDigest {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.0
    }
}

/// Immutable blob storage keyed by content hash
#[derive(Clone)]
pub struct ContentStore {
    backend: Arc<dyn BlobStore>,
}

impl ContentStore {
    pub fn new(backend: Arc<dyn BlobStore>) -> Self {
        Self { backend }
    }

    /// Store bytes, returning their digest. The physical write is skipped
    /// when an object with the same digest already exists.
    pub async fn put(&self, bytes: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::of(bytes);
        let written = self
            .backend
            .write_if_absent(&digest.storage_path(), bytes)
            .await?;

        if written {
            debug!(digest = %digest.short(), size = bytes.len(), "cas store");
        } else {
            debug!(digest = %digest.short(), "cas hit");
        }
        Ok(digest)
    }

    pub async fn put_text(&self, text: &str) -> StorageResult<ContentDigest> {
        self.put(text.as_bytes()).await
    }

    /// Full object bytes, `NotFound` when absent
    pub async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        self.backend
            .read(&digest.storage_path())
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => StorageError::NotFound(format!("cas object {}", digest)),
                other => other,
            })
    }

    pub async fn get_text(&self, digest: &ContentDigest) -> StorageResult<String> {
        let bytes = self.get(digest).await?;
        String::from_utf8(bytes).map_err(|_| StorageError::Utf8 {
            location: format!("cas object {}", digest),
        })
    }

    /// Existence check; backend errors are logged and reported as absent
    pub async fn exists(&self, digest: &ContentDigest) -> bool {
        match self.backend.exists(&digest.storage_path()).await {
            Ok(found) => found,
            Err(e) => {
                warn!(digest = %digest.short(), error = %e, "cas existence check failed");
                false
            }
        }
    }
}
