//! End-to-end runs through the orchestrator with stub collaborators.

mod common;

use std::sync::atomic::Ordering;

use common::{context, Doubles, StubScraper};
use powerflow::domain::{Manufacturer, ProductType, RunState, StepKind, StepStatus, TriggerPayload};
use powerflow::{EventType, Orchestrator, Storage};
use tempfile::TempDir;

fn orchestrator(temp: &TempDir, doubles: &Doubles) -> Orchestrator {
    let ctx = context(Storage::local(temp.path().join("store")), doubles.collaborators());
    Orchestrator::new(ctx, temp.path().join("runs"), temp.path().join("locks"))
}

fn payload() -> TriggerPayload {
    TriggerPayload::new(Manufacturer::Recom, vec![ProductType::DcDcConverters])
}

#[tokio::test]
async fn test_full_run_produces_a_report_per_step() {
    let temp = TempDir::new().unwrap();
    let doubles = Doubles::new(StubScraper::new(2, 2));
    let orchestrator = orchestrator(&temp, &doubles);

    let run = orchestrator.run(payload()).await.unwrap();

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.results.len(), 6);
    let report = run.report();
    assert_eq!(report["dc-dc-converters_series"]["count"], 2);
    assert_eq!(report["dc-dc-converters_pdfs"]["count"], 4);
    assert_eq!(report["dc-dc-converters_validated"]["count"], 2);
    assert_eq!(report["dc-dc-converters_validated"]["success"], true);

    let merged = temp
        .path()
        .join("store/data/recom9_validate_data/schema_v8/dc-dc-converters_merged.json");
    assert!(merged.is_file());

    let replayed = orchestrator.status(run.id).await.unwrap();
    assert_eq!(replayed.state, RunState::Completed);
    assert_eq!(replayed.results, run.results);
}

#[tokio::test]
async fn test_resume_after_extraction_failure() {
    let temp = TempDir::new().unwrap();
    let doubles = Doubles::new(StubScraper::new(2, 1));
    doubles.text.fail.store(true, Ordering::SeqCst);
    let orchestrator = orchestrator(&temp, &doubles);

    let failed = orchestrator.run(payload()).await.unwrap();
    let text = failed
        .result(&payload().lanes()[0], StepKind::ExtractText)
        .unwrap();
    assert_eq!(text.status, StepStatus::Failed);
    assert_eq!(
        failed.result(&payload().lanes()[0], StepKind::Validate).unwrap().status,
        StepStatus::Skipped
    );
    assert_eq!(failed.state, RunState::CompletedWithFailures { failed: 3, partial: 0 });
    assert_eq!(doubles.structured.calls(), 0);

    doubles.text.fail.store(false, Ordering::SeqCst);
    let resumed = orchestrator.resume(failed.id).await.unwrap();

    assert_eq!(resumed.id, failed.id);
    assert_eq!(resumed.state, RunState::Completed);
    // Scraping and downloads were kept, not redone
    assert_eq!(doubles.scraper.product_calls.load(Ordering::SeqCst), 2);
    assert_eq!(doubles.downloader.calls(), 4);
    assert_eq!(doubles.structured.calls(), 2);

    let store = powerflow::core::EventStore::open_existing(&temp.path().join("runs"), failed.id)
        .await
        .unwrap();
    let events = store.replay().await.unwrap();
    assert_eq!(events.first().unwrap().event_type, EventType::RunStarted);
    assert!(events.iter().any(|e| e.event_type == EventType::RunResumed));
    assert_eq!(events.last().unwrap().event_type, EventType::RunCompleted);
}

#[tokio::test]
async fn test_run_from_reuses_earlier_artifacts() {
    let temp = TempDir::new().unwrap();
    let doubles = Doubles::new(StubScraper::new(2, 1));
    let orchestrator = orchestrator(&temp, &doubles);

    orchestrator.run(payload()).await.unwrap();
    assert_eq!(doubles.structured.calls(), 2);

    let rerun = orchestrator
        .run_from(payload(), StepKind::StructureData)
        .await
        .unwrap();

    assert_eq!(rerun.results.len(), 2);
    assert_eq!(rerun.state, RunState::Completed);
    assert_eq!(doubles.scraper.product_calls.load(Ordering::SeqCst), 2);
    assert_eq!(doubles.structured.calls(), 2);
    assert_eq!(rerun.results[0].counts.reused, 2);
}

#[tokio::test]
async fn test_missing_collaborator_stops_before_any_step() {
    let temp = TempDir::new().unwrap();
    let doubles = Doubles::new(StubScraper::new(1, 1));
    let orchestrator = orchestrator(&temp, &doubles);

    let traco = TriggerPayload::new(Manufacturer::Traco, vec![ProductType::DcDcConverters]);
    let err = orchestrator.run(traco).await.unwrap_err();

    assert!(err.to_string().contains("scraper"), "{}", err);
    assert!(orchestrator.list_runs(10).await.unwrap().is_empty());
}
