//! Idempotency Integration Tests
//!
//! Tests for idempotency key generation and completed-step detection in
//! the run journal.

use powerflow::core::{generate_idempotency_key, EventStore};
use powerflow::domain::{Event, EventType, Lane, Manufacturer, ProductType, StepKind, StepStatus};
use tempfile::TempDir;
use uuid::Uuid;

fn lane() -> Lane {
    Lane::new(Manufacturer::Traco, ProductType::AcDcPowerSupplies)
}

fn event(run_id: Uuid, event_type: EventType, key: &str, status: StepStatus) -> Event {
    Event::new(run_id, event_type, key.to_string(), format!("{:?}", event_type), status)
        .for_step(lane(), StepKind::StructureData)
}

#[test]
fn test_idempotency_key_format() {
    let run_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
    let key = generate_idempotency_key(
        run_id,
        &lane(),
        StepKind::StructureData,
        "traco5_structured_product_data/schema_v11",
    );

    // {run_id}:{lane}:{step}:{input_hash}
    let parts: Vec<&str> = key.split(':').collect();
    assert_eq!(parts.len(), 4, "{}", key);
    assert_eq!(parts[0], "550e8400-e29b-41d4-a716-446655440000");
    assert_eq!(parts[1], "traco_ac-dc-power-supplies");
    assert_eq!(parts[2], "structure_data");
    assert_eq!(parts[3].len(), 16);
    assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_keys_differ_by_lane_step_and_input() {
    let run_id = Uuid::new_v4();
    let other_lane = Lane::new(Manufacturer::Traco, ProductType::DcDcConverters);

    let base = generate_idempotency_key(run_id, &lane(), StepKind::ExtractText, "a");
    assert_eq!(base, generate_idempotency_key(run_id, &lane(), StepKind::ExtractText, "a"));
    assert_ne!(base, generate_idempotency_key(run_id, &other_lane, StepKind::ExtractText, "a"));
    assert_ne!(base, generate_idempotency_key(run_id, &lane(), StepKind::StructureData, "a"));
    assert_ne!(base, generate_idempotency_key(run_id, &lane(), StepKind::ExtractText, "b"));
    assert_ne!(base, generate_idempotency_key(Uuid::new_v4(), &lane(), StepKind::ExtractText, "a"));
}

#[tokio::test]
async fn test_only_completed_steps_count_as_done() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();
    let key = generate_idempotency_key(run_id, &lane(), StepKind::StructureData, "input");

    assert!(!store.is_step_completed(&key).await.unwrap());

    store
        .append(&event(run_id, EventType::StepStarted, &key, StepStatus::Running))
        .await
        .unwrap();
    store
        .append(
            &event(run_id, EventType::StepFailed, &key, StepStatus::Failed)
                .with_error("No units succeeded".to_string()),
        )
        .await
        .unwrap();
    assert!(!store.is_step_completed(&key).await.unwrap());

    store
        .append(&event(run_id, EventType::StepCompleted, &key, StepStatus::Succeeded))
        .await
        .unwrap();
    assert!(store.is_step_completed(&key).await.unwrap());

    let other = generate_idempotency_key(run_id, &lane(), StepKind::Validate, "input");
    assert!(!store.is_step_completed(&other).await.unwrap());
}

#[tokio::test]
async fn test_later_failure_supersedes_completion() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();
    let key = generate_idempotency_key(run_id, &lane(), StepKind::Validate, "input");

    store
        .append(&event(run_id, EventType::StepCompleted, &key, StepStatus::Succeeded))
        .await
        .unwrap();
    // Re-executed on resume after its upstream step was redone
    store
        .append(&event(run_id, EventType::StepStarted, &key, StepStatus::Running))
        .await
        .unwrap();
    assert!(store.is_step_completed(&key).await.unwrap());

    store
        .append(&event(run_id, EventType::StepSkipped, &key, StepStatus::Skipped))
        .await
        .unwrap();
    assert!(!store.is_step_completed(&key).await.unwrap());
}

#[tokio::test]
async fn test_latest_event_of_a_type() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();

    for key in ["first", "second"] {
        store
            .append(&event(run_id, EventType::StepFailed, key, StepStatus::Failed))
            .await
            .unwrap();
    }
    store
        .append(&event(run_id, EventType::StepStarted, "third", StepStatus::Running))
        .await
        .unwrap();

    let last = store.last_event_of_type(EventType::StepFailed).await.unwrap().unwrap();
    assert_eq!(last.idempotency_key, "second");
    assert!(store.last_event_of_type(EventType::RunCompleted).await.unwrap().is_none());
}
