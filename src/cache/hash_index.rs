//! Upstream-hash to derived-hash side tables.
//!
//! A hash index lets a step skip redoing a derivation (download, text
//! extraction) when the same upstream input shows up again. It is a JSON
//! object persisted in the owning step's namespace.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::storage::{StepStore, StorageError};

#[derive(Debug, Clone)]
pub struct HashIndex {
    step_name: String,
    file_name: String,
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl HashIndex {
    /// Empty index that will be saved at `(step_name, file_name)`
    pub fn new(step_name: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            file_name: file_name.into(),
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Load an existing index. A missing or unreadable file yields an empty one.
    pub async fn load(
        store: &StepStore,
        step_name: &str,
        file_name: &str,
    ) -> Result<Self, StorageError> {
        let mut index = Self::new(step_name, file_name);

        match store
            .read_json::<BTreeMap<String, String>>(step_name, file_name)
            .await
        {
            Ok(entries) => {
                debug!(step = step_name, file = file_name, entries = entries.len(), "Loaded hash index");
                index.entries = entries;
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e @ (StorageError::Json { .. } | StorageError::Utf8 { .. })) => {
                warn!(step = step_name, file = file_name, error = %e, "Starting from empty hash index");
            }
            Err(e) => return Err(e),
        }

        Ok(index)
    }

    pub fn get(&self, upstream: &str) -> Option<&str> {
        self.entries.get(upstream).map(String::as_str)
    }

    pub fn insert(&mut self, upstream: impl Into<String>, derived: impl Into<String>) {
        let upstream = upstream.into();
        let derived = derived.into();
        if self.entries.get(&upstream) != Some(&derived) {
            self.entries.insert(upstream, derived);
            self.dirty = true;
        }
    }

    /// Drop an entry whose derived object has gone missing
    pub fn remove(&mut self, upstream: &str) -> Option<String> {
        let removed = self.entries.remove(upstream);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist the index if it changed since the last save
    pub async fn save(&mut self, store: &StepStore) -> Result<(), StorageError> {
        if !self.dirty {
            return Ok(());
        }
        store
            .write_json(&self.step_name, &self.file_name, &self.entries)
            .await?;
        self.dirty = false;
        debug!(step = %self.step_name, file = %self.file_name, entries = self.entries.len(), "Saved hash index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_missing_index_loads_empty() {
        let store = StepStore::new(Arc::new(MemoryBlobStore::new()));
        let index = HashIndex::load(&store, "recom4_extract_pdf_data", "idx.json")
            .await
            .unwrap();
        assert!(index.is_empty());
        assert!(!index.is_dirty());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let store = StepStore::new(Arc::new(MemoryBlobStore::new()));
        let mut index = HashIndex::new("step", "idx.json");
        index.insert("pdf-a", "text-a");
        index.save(&store).await.unwrap();
        assert!(!index.is_dirty());

        let reloaded = HashIndex::load(&store, "step", "idx.json").await.unwrap();
        assert_eq!(reloaded.get("pdf-a"), Some("text-a"));
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_empty() {
        let store = StepStore::new(Arc::new(MemoryBlobStore::new()));
        store.write_text("step", "idx.json", "{not json").await.unwrap();

        let index = HashIndex::load(&store, "step", "idx.json").await.unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_reinserting_same_value_is_clean() {
        let mut index = HashIndex::new("s", "f");
        index.insert("a", "b");
        index.dirty = false;
        index.insert("a", "b");
        assert!(!index.is_dirty());
    }
}
