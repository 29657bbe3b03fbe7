//! Mutable step store.
//!
//! Artifacts are addressed by `(step_name, file_name)` and live at
//! `data/<step_name>/<file_name>`. Every write overwrites. Step names may
//! carry `/`-separated namespace suffixes (`recom9_validate_data/schema_v8`);
//! file names may not.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::backend::{validate_key, BlobStore};
use super::error::{StorageError, StorageResult};
use crate::domain::Table;

/// Root prefix of every step artifact key
pub const DATA_ROOT: &str = "data";

/// Overwritable artifact storage keyed by step and file name
#[derive(Clone)]
pub struct StepStore {
    backend: Arc<dyn BlobStore>,
}

impl StepStore {
    pub fn new(backend: Arc<dyn BlobStore>) -> Self {
        Self { backend }
    }

    fn step_dir(step_name: &str) -> StorageResult<String> {
        let dir = format!("{}/{}", DATA_ROOT, step_name);
        validate_key(&dir)?;
        Ok(dir)
    }

    fn key(step_name: &str, file_name: &str) -> StorageResult<String> {
        if file_name.is_empty() || file_name.contains('/') {
            return Err(StorageError::InvalidKey {
                key: file_name.to_string(),
                reason: "file names are a single path segment",
            });
        }
        let key = format!("{}/{}", Self::step_dir(step_name)?, file_name);
        validate_key(&key)?;
        Ok(key)
    }

    fn location(step_name: &str, file_name: &str) -> String {
        format!("{}/{}", step_name, file_name)
    }

    pub async fn write_bytes(&self, step_name: &str, file_name: &str, data: &[u8]) -> StorageResult<()> {
        let key = Self::key(step_name, file_name)?;
        self.backend.write(&key, data).await
    }

    pub async fn write_text(&self, step_name: &str, file_name: &str, text: &str) -> StorageResult<()> {
        self.write_bytes(step_name, file_name, text.as_bytes()).await
    }

    /// Write a table as CSV with header
    pub async fn write_table(&self, step_name: &str, file_name: &str, table: &Table) -> StorageResult<()> {
        let bytes = table.to_csv().map_err(|source| StorageError::Csv {
            location: Self::location(step_name, file_name),
            source,
        })?;
        self.write_bytes(step_name, file_name, &bytes).await
    }

    /// Write any serialisable value as pretty-printed JSON
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        step_name: &str,
        file_name: &str,
        value: &T,
    ) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Json {
            location: Self::location(step_name, file_name),
            source,
        })?;
        self.write_bytes(step_name, file_name, &bytes).await
    }

    /// Artifact bytes, `NotFound` when absent
    pub async fn read_bytes(&self, step_name: &str, file_name: &str) -> StorageResult<Vec<u8>> {
        let key = Self::key(step_name, file_name)?;
        self.backend.read(&key).await.map_err(|e| match e {
            StorageError::NotFound(_) => StorageError::NotFound(Self::location(step_name, file_name)),
            other => other,
        })
    }

    pub async fn read_text(&self, step_name: &str, file_name: &str) -> StorageResult<String> {
        let bytes = self.read_bytes(step_name, file_name).await?;
        String::from_utf8(bytes).map_err(|_| StorageError::Utf8 {
            location: Self::location(step_name, file_name),
        })
    }

    pub async fn read_table(&self, step_name: &str, file_name: &str) -> StorageResult<Table> {
        let bytes = self.read_bytes(step_name, file_name).await?;
        Table::from_csv(&bytes).map_err(|source| StorageError::Csv {
            location: Self::location(step_name, file_name),
            source,
        })
    }

    pub async fn read_json<T: DeserializeOwned>(&self, step_name: &str, file_name: &str) -> StorageResult<T> {
        let bytes = self.read_bytes(step_name, file_name).await?;
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Json {
            location: Self::location(step_name, file_name),
            source,
        })
    }

    pub async fn exists(&self, step_name: &str, file_name: &str) -> StorageResult<bool> {
        let key = Self::key(step_name, file_name)?;
        self.backend.exists(&key).await
    }

    /// File names under a step whose name starts with `prefix`, sorted.
    /// Each call lists afresh.
    pub async fn list(&self, step_name: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let dir = Self::step_dir(step_name)?;
        let names = self.backend.list(&dir).await?;
        Ok(names.into_iter().filter(|n| n.starts_with(prefix)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Record;
    use crate::storage::MemoryBlobStore;

    fn store() -> StepStore {
        StepStore::new(Arc::new(MemoryBlobStore::new()))
    }

    #[tokio::test]
    async fn test_table_round_trip_preserves_columns() {
        let store = store();
        let table = Table::from_records(vec![
            Record::new().with("product_name", "R-78").with("product_link", "/x"),
            Record::new().with("product_name", "R-78B").with("product_link", "/y"),
        ]);

        store
            .write_table("recom1_scrape_series", "dc-dc-converters.csv", &table)
            .await
            .unwrap();
        let read = store
            .read_table("recom1_scrape_series", "dc-dc-converters.csv")
            .await
            .unwrap();

        assert_eq!(read, table);
        assert_eq!(read.columns(), &["product_name", "product_link"]);
    }

    #[tokio::test]
    async fn test_namespaced_step_names() {
        let store = store();
        store
            .write_json("recom9_validate_data/schema_v8", "merged.json", &vec![1, 2, 3])
            .await
            .unwrap();

        let read: Vec<u32> = store
            .read_json("recom9_validate_data/schema_v8", "merged.json")
            .await
            .unwrap();
        assert_eq!(read, vec![1, 2, 3]);
        assert!(!store
            .exists("recom9_validate_data/schema_v9", "merged.json")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_file_names_are_single_segments() {
        let store = store();
        assert!(store.write_text("step", "a/b.txt", "x").await.is_err());
        assert!(store.write_text("step/../other", "b.txt", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let store = store();
        for name in ["abc_pdf.json", "abc_html.json", "cache_1.json", "index.csv"] {
            store.write_text("s", name, "{}").await.unwrap();
        }

        assert_eq!(
            store.list("s", "abc_").await.unwrap(),
            vec!["abc_html.json".to_string(), "abc_pdf.json".to_string()]
        );
        assert_eq!(store.list("s", "").await.unwrap().len(), 4);
    }
}
