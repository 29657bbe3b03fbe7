//! Extraction cache integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use powerflow::cache::{CacheKey, CacheKeyMode, ExtractionCache};
use powerflow::storage::{Storage, StorageError};
use serde_json::json;

const NAMESPACE: &str = "recom5_structured_product_data/schema_v11";

#[derive(Debug, thiserror::Error)]
enum CallError {
    #[error("model unavailable")]
    Unavailable,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn key(text: &str) -> CacheKey {
    CacheKey::derive(text, &json!({"products": [{"part_number": "R-78B5.0"}]}), CacheKeyMode::Full)
}

#[tokio::test]
async fn test_second_call_is_served_from_cache() {
    let storage = Storage::in_memory();
    let cache = ExtractionCache::new(storage.steps.clone());
    let calls = AtomicUsize::new(0);
    let key = key("datasheet text");

    for expected_hit in [false, true] {
        let fetched = cache
            .compute_or_fetch::<Vec<String>, CallError, _, _>(NAMESPACE, &key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec!["R-78B5.0".to_string()])
            })
            .await
            .unwrap();

        assert_eq!(fetched.hit, expected_hit);
        assert_eq!(fetched.value, vec!["R-78B5.0"]);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(storage.steps.exists(NAMESPACE, &key.file_name()).await.unwrap());
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let cache = ExtractionCache::new(Storage::in_memory().steps);
    let key = key("datasheet text");

    let failed = cache
        .compute_or_fetch::<Vec<String>, CallError, _, _>(NAMESPACE, &key, || async {
            Err(CallError::Unavailable)
        })
        .await;
    assert!(matches!(failed, Err(CallError::Unavailable)));
    assert!(!cache.contains(NAMESPACE, &key).await.unwrap());

    let retried = cache
        .compute_or_fetch::<Vec<String>, CallError, _, _>(NAMESPACE, &key, || async {
            Ok(vec!["ok".to_string()])
        })
        .await
        .unwrap();
    assert!(!retried.hit);
    assert_eq!(retried.value, vec!["ok"]);
}

#[tokio::test]
async fn test_corrupt_entry_is_recomputed() {
    let storage = Storage::in_memory();
    let cache = ExtractionCache::new(storage.steps.clone());
    let key = key("datasheet text");

    storage
        .steps
        .write_text(NAMESPACE, &key.file_name(), "{ truncated")
        .await
        .unwrap();

    let fetched = cache
        .compute_or_fetch::<Vec<String>, CallError, _, _>(NAMESPACE, &key, || async {
            Ok(vec!["fresh".to_string()])
        })
        .await
        .unwrap();

    assert!(!fetched.hit);
    let stored: Vec<String> = storage.steps.read_json(NAMESPACE, &key.file_name()).await.unwrap();
    assert_eq!(stored, vec!["fresh"]);
}

#[tokio::test]
async fn test_namespaces_do_not_share_entries() {
    let cache = ExtractionCache::new(Storage::in_memory().steps);
    let key = key("datasheet text");

    cache
        .compute_or_fetch::<u32, CallError, _, _>(NAMESPACE, &key, || async { Ok(11) })
        .await
        .unwrap();

    let next_schema = cache
        .compute_or_fetch::<u32, CallError, _, _>(
            "recom5_structured_product_data/schema_v12",
            &key,
            || async { Ok(12) },
        )
        .await
        .unwrap();

    assert!(!next_schema.hit);
    assert_eq!(next_schema.value, 12);
}
