//! Step integration tests over in-memory storage with stub collaborators.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{context, context_with, invocation, recom_dcdc, test_settings, Doubles, StubDownloader, StubScraper};
use powerflow::adapters::{Collaborators, ExternalError, Scraper};
use powerflow::cache::HashIndex;
use powerflow::config::PipelineSettings;
use powerflow::core::{run_step, Step, StepContext};
use powerflow::domain::{Lane, Manufacturer, ProductType, Record, StepKind, StepResult, StepStatus, Table};
use powerflow::steps::download::url_index_file;
use powerflow::steps::extract_text::text_index_file;
use powerflow::steps::structure::{batch_file, index_file, rows_file};
use powerflow::steps::validate::merged_file;
use powerflow::steps::{standard_steps, ValidatedEntry, IMAGE_HASH, PDF_HASH, TEXT_HASH};
use powerflow::storage::{ContentDigest, Storage};
use tokio::time::timeout;

async fn run(ctx: &StepContext, kind: StepKind) -> StepResult {
    let steps = standard_steps();
    let step = steps
        .iter()
        .find(|s| s.kind() == kind)
        .unwrap_or_else(|| panic!("no implementation for {}", kind));
    run_step(step.as_ref(), ctx, &invocation(kind, recom_dcdc())).await
}

async fn run_through(ctx: &StepContext, last: StepKind) -> Vec<StepResult> {
    let mut results = Vec::new();
    for kind in StepKind::ALL {
        results.push(run(ctx, kind).await);
        if kind == last {
            break;
        }
    }
    results
}

fn step_name(kind: StepKind) -> String {
    invocation(kind, recom_dcdc()).step_name
}

#[tokio::test]
async fn test_failing_series_is_counted_and_skipped() {
    let doubles = Doubles::new(StubScraper::new(10, 2).failing("S5"));
    let ctx = context(Storage::in_memory(), doubles.collaborators());

    let results = run_through(&ctx, StepKind::ScrapeProducts).await;
    let products = &results[1];

    assert_eq!(results[0].status, StepStatus::Succeeded);
    assert_eq!(results[0].counts.count, 10);

    assert_eq!(products.status, StepStatus::PartialSuccess);
    assert_eq!(products.counts.count, 9);
    assert_eq!(products.counts.failures, 1);
    assert!(products.error.as_deref().unwrap_or("").starts_with("S5:"));
    assert_eq!(doubles.scraper.product_calls.load(Ordering::SeqCst), 10);

    let table = ctx
        .storage
        .steps
        .read_table(&step_name(StepKind::ScrapeProducts), "dc-dc-converters.csv")
        .await
        .unwrap();
    assert_eq!(table.len(), 18);
    assert!(table.rows().iter().all(|r| r.get("series") != Some("S5")));
    assert_eq!(table.rows()[0].get("series"), Some("S1"));
}

#[tokio::test]
async fn test_missing_upstream_fails_without_output() {
    let doubles = Doubles::new(StubScraper::new(3, 1));
    let ctx = context(Storage::in_memory(), doubles.collaborators());

    let result = run(&ctx, StepKind::ScrapeProducts).await;

    assert_eq!(result.status, StepStatus::Failed);
    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .unwrap_or("")
        .contains("Previous step data not found"));
    assert!(!ctx
        .storage
        .steps
        .exists(&step_name(StepKind::ScrapeProducts), "dc-dc-converters.csv")
        .await
        .unwrap());
    assert_eq!(doubles.scraper.product_calls.load(Ordering::SeqCst), 0);
}

/// Returns the single product `R-78B` for any series
struct SingleProduct;

#[async_trait]
impl Scraper for SingleProduct {
    async fn scrape_series(&self, _lane: &Lane) -> Result<Vec<Record>, ExternalError> {
        Ok(Vec::new())
    }

    async fn scrape_products(&self, _lane: &Lane, _series: &Record) -> Result<Vec<Record>, ExternalError> {
        Ok(vec![Record::new()
            .with("part_number", "R-78B")
            .with("datasheet_link", "/pdf/r-78b.pdf")])
    }
}

#[tokio::test]
async fn test_single_series_end_to_end() {
    let storage = Storage::in_memory();
    let collaborators = Collaborators::new().with_scraper(Manufacturer::Recom, Arc::new(SingleProduct));
    let ctx = context(storage, collaborators);

    let series = Table::from_records(vec![Record::new()
        .with("product_name", "R-78")
        .with("product_link", "/x")]);
    ctx.storage
        .steps
        .write_table(&step_name(StepKind::ScrapeSeries), "dc-dc-converters.csv", &series)
        .await
        .unwrap();

    let result = run(&ctx, StepKind::ScrapeProducts).await;

    assert_eq!(result.status, StepStatus::Succeeded);
    assert_eq!(result.step_name, "recom2_scrape_products");
    assert_eq!(result.file_name.as_deref(), Some("dc-dc-converters.csv"));
    assert_eq!((result.counts.count, result.counts.total), (1, 1));

    let table = ctx
        .storage
        .steps
        .read_table("recom2_scrape_products", "dc-dc-converters.csv")
        .await
        .unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table.rows()[0].get("part_number"), Some("R-78B"));
    assert_eq!(table.rows()[0].get("series"), Some("R-78"));
}

#[tokio::test]
async fn test_interrupted_scrape_resumes_from_checkpoint() {
    let storage = Storage::in_memory();
    let stalled = Doubles::new(StubScraper::new(5, 2).stalling_after(3));
    let ctx = context(storage.clone(), stalled.collaborators());
    run(&ctx, StepKind::ScrapeSeries).await;

    // Killed while the fourth series is in flight
    let interrupted = timeout(Duration::from_millis(500), run(&ctx, StepKind::ScrapeProducts)).await;
    assert!(interrupted.is_err());

    let products = step_name(StepKind::ScrapeProducts);
    let partial = storage.steps.read_table(&products, "dc-dc-converters.csv").await.unwrap();
    let series: Vec<_> = partial.rows().iter().filter_map(|r| r.get("series")).collect();
    assert_eq!(series, vec!["S1", "S1", "S2", "S2"]);

    let fresh = Doubles::new(StubScraper::new(5, 2));
    let ctx = context(storage.clone(), fresh.collaborators());
    let result = run(&ctx, StepKind::ScrapeProducts).await;

    assert_eq!(result.status, StepStatus::Succeeded);
    assert_eq!(result.counts.count, 5);
    assert_eq!(result.counts.reused, 2);
    assert_eq!(fresh.scraper.product_calls.load(Ordering::SeqCst), 3);
    let table = storage.steps.read_table(&products, "dc-dc-converters.csv").await.unwrap();
    assert_eq!(table.len(), 10);
}

#[tokio::test]
async fn test_interrupted_download_resumes_from_checkpoint() {
    let storage = Storage::in_memory();
    let settings = PipelineSettings {
        download_concurrency: 1,
        ..test_settings()
    };

    let stalled = Doubles::with_downloader(StubScraper::new(3, 2), StubDownloader::default().stalling_after(4));
    let ctx = context_with(storage.clone(), stalled.collaborators(), settings.clone());
    run_through(&ctx, StepKind::ScrapeProducts).await;

    let interrupted = timeout(Duration::from_millis(500), run(&ctx, StepKind::DownloadAssets)).await;
    assert!(interrupted.is_err());
    assert_eq!(stalled.downloader.calls(), 5);

    // Checkpoints after every second URL: datasheet and image of S1 and S2
    let downloads = step_name(StepKind::DownloadAssets);
    let partial = storage.steps.read_table(&downloads, "dc-dc-converters.csv").await.unwrap();
    assert_eq!(partial.len(), 4);
    let index = HashIndex::load(&storage.steps, &downloads, &url_index_file(ProductType::DcDcConverters))
        .await
        .unwrap();
    assert_eq!(index.len(), 4);

    let fresh = Doubles::new(StubScraper::new(3, 2));
    let ctx = context_with(storage.clone(), fresh.collaborators(), settings);
    let result = run(&ctx, StepKind::DownloadAssets).await;

    assert_eq!(result.status, StepStatus::Succeeded);
    assert_eq!(result.counts.count, 6);
    assert_eq!(result.counts.reused, partial.len());
    assert_eq!(fresh.downloader.calls(), 2);
}

#[tokio::test]
async fn test_shared_datasheets_download_once() {
    let doubles = Doubles::new(StubScraper::new(3, 2));
    let ctx = context(Storage::in_memory(), doubles.collaborators());

    let results = run_through(&ctx, StepKind::DownloadAssets).await;
    let download = &results[2];

    // One datasheet and one image per series
    assert_eq!(doubles.downloader.calls(), 6);
    assert_eq!(download.status, StepStatus::Succeeded);
    assert_eq!(download.counts.count, 6);
    assert_eq!(download.counts.reused, 0);

    let table = ctx
        .storage
        .steps
        .read_table(&step_name(StepKind::DownloadAssets), "dc-dc-converters.csv")
        .await
        .unwrap();
    assert_eq!(table.rows()[0].get(PDF_HASH), table.rows()[1].get(PDF_HASH));
    assert_ne!(table.rows()[0].get(PDF_HASH), table.rows()[2].get(PDF_HASH));
    assert!(table.rows().iter().all(|r| r.get_nonempty(IMAGE_HASH).is_some()));

    let rerun = run(&ctx, StepKind::DownloadAssets).await;
    assert_eq!(doubles.downloader.calls(), 6);
    assert_eq!(rerun.counts.count, 6);
    assert_eq!(rerun.counts.reused, 6);
}

#[tokio::test]
async fn test_failed_datasheet_drops_its_products() {
    let downloader = StubDownloader::default()
        .failing("https://recom-power.com/pdf/S2.pdf")
        .failing("https://recom-power.com/img/S3.png");
    let doubles = Doubles::with_downloader(StubScraper::new(3, 2), downloader);
    let ctx = context(Storage::in_memory(), doubles.collaborators());

    let results = run_through(&ctx, StepKind::DownloadAssets).await;
    let download = &results[2];

    assert_eq!(download.status, StepStatus::PartialSuccess);
    assert_eq!(download.counts.count, 4);
    assert_eq!(download.counts.failures, 2);

    let table = ctx
        .storage
        .steps
        .read_table(&step_name(StepKind::DownloadAssets), "dc-dc-converters.csv")
        .await
        .unwrap();
    let parts: Vec<_> = table.rows().iter().filter_map(|r| r.get("part_number")).collect();
    assert_eq!(parts, vec!["S1-1", "S1-2", "S3-1", "S3-2"]);
    // A missing image does not cost the product its datasheet
    assert_eq!(table.rows()[2].get(IMAGE_HASH), Some(""));
}

#[tokio::test]
async fn test_text_is_extracted_once_per_datasheet() {
    let doubles = Doubles::new(StubScraper::new(3, 2));
    let ctx = context(Storage::in_memory(), doubles.collaborators());

    let results = run_through(&ctx, StepKind::ExtractText).await;
    assert_eq!(doubles.text.calls(), 3);
    assert_eq!(results[3].counts.count, 6);

    let table = ctx
        .storage
        .steps
        .read_table(&step_name(StepKind::ExtractText), "dc-dc-converters.csv")
        .await
        .unwrap();
    let digest = table.rows()[0].get(TEXT_HASH).unwrap().parse().unwrap();
    let text = ctx.storage.cas.get_text(&digest).await.unwrap();
    assert!(text.starts_with("%PDF https://recom-power.com/pdf/S1.pdf"));

    let rerun = run(&ctx, StepKind::ExtractText).await;
    assert_eq!(doubles.text.calls(), 3);
    assert_eq!(rerun.counts.reused, 6);
}

#[tokio::test]
async fn test_failed_extraction_leaves_no_output() {
    let doubles = Doubles::new(StubScraper::new(2, 1));
    doubles.text.fail.store(true, Ordering::SeqCst);
    let ctx = context(Storage::in_memory(), doubles.collaborators());

    let results = run_through(&ctx, StepKind::ExtractText).await;
    let text = &results[3];

    assert_eq!(text.status, StepStatus::Failed);
    assert_eq!(text.counts.failures, 2);
    assert!(text.error.as_deref().unwrap_or("").starts_with("No units succeeded"));
    assert!(!ctx
        .storage
        .steps
        .exists(&step_name(StepKind::ExtractText), "dc-dc-converters.csv")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_structure_and_validate() {
    let doubles = Doubles::new(StubScraper::new(3, 2));
    let ctx = context(Storage::in_memory(), doubles.collaborators());

    let results = run_through(&ctx, StepKind::Validate).await;
    assert!(results.iter().all(|r| r.status == StepStatus::Succeeded), "{:#?}", results);

    let structure = &results[4];
    assert_eq!(doubles.structured.calls(), 3);
    assert_eq!(structure.counts.count, 3);
    assert_eq!(structure.file_name.as_deref(), Some("dc-dc-converters_index.csv"));

    let structured = step_name(StepKind::StructureData);
    let index = ctx
        .storage
        .steps
        .read_table(&structured, &index_file(recom_dcdc().product_type))
        .await
        .unwrap();
    assert_eq!(index.len(), 6);
    assert!(index.rows().iter().all(|r| r.get("type") == Some("DCDC")));

    let pdf_hash = index.rows()[0].get(PDF_HASH).unwrap();
    assert!(ctx.storage.steps.exists(&structured, &batch_file(pdf_hash)).await.unwrap());
    assert!(ctx.storage.steps.exists(&structured, &rows_file(pdf_hash)).await.unwrap());

    let entries: Vec<ValidatedEntry> = ctx
        .storage
        .steps
        .read_json(&step_name(StepKind::Validate), &merged_file(recom_dcdc().product_type))
        .await
        .unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].hash, pdf_hash);
    assert_eq!(entries[0].pdf.len(), 2);
    assert_eq!(entries[0].html.len(), 2);
    assert_eq!(entries[0].fields.get("efficiency"), Some("91"));

    let rerun = run(&ctx, StepKind::StructureData).await;
    assert_eq!(doubles.structured.calls(), 3);
    assert_eq!(rerun.counts.reused, 3);
}

#[tokio::test]
async fn test_structured_failures_are_not_cached() {
    let doubles = Doubles::new(StubScraper::new(2, 1));
    doubles.structured.fail.store(true, Ordering::SeqCst);
    let ctx = context(Storage::in_memory(), doubles.collaborators());

    let results = run_through(&ctx, StepKind::StructureData).await;
    assert_eq!(results[4].status, StepStatus::Failed);
    assert_eq!(results[4].counts.failures, 2);

    doubles.structured.fail.store(false, Ordering::SeqCst);
    let retried = run(&ctx, StepKind::StructureData).await;
    assert_eq!(retried.status, StepStatus::Succeeded);
    assert_eq!(retried.counts.reused, 0);
    assert_eq!(doubles.structured.calls(), 4);
}

#[tokio::test]
async fn test_cache_keeps_the_model_document_as_returned() {
    let doubles = Doubles::new(StubScraper::new(1, 1));
    let ctx = context(Storage::in_memory(), doubles.collaborators());
    run_through(&ctx, StepKind::StructureData).await;

    let structured = step_name(StepKind::StructureData);
    let entries = ctx.storage.steps.list(&structured, "cache_").await.unwrap();
    assert_eq!(entries.len(), 1);

    let cached: serde_json::Value = ctx.storage.steps.read_json(&structured, &entries[0]).await.unwrap();
    assert_eq!(cached["model_notes"], "tables read from page 2");
    assert_eq!(cached["power_converters"][0]["part_number"], "S1-1");
}

#[tokio::test]
async fn test_stale_text_index_entry_is_dropped() {
    let doubles = Doubles::new(StubScraper::new(1, 1));
    let ctx = context(Storage::in_memory(), doubles.collaborators());
    run_through(&ctx, StepKind::ExtractText).await;

    let text_step = step_name(StepKind::ExtractText);
    let index_file = text_index_file(ProductType::DcDcConverters);
    let mut index = HashIndex::load(&ctx.storage.steps, &text_step, &index_file).await.unwrap();
    let pdf_hash = ctx
        .storage
        .steps
        .read_table(&text_step, "dc-dc-converters.csv")
        .await
        .unwrap()
        .rows()[0]
        .get(PDF_HASH)
        .unwrap()
        .to_string();

    // Points at text the content store never held
    index.insert(pdf_hash.as_str(), ContentDigest::of(b"gone").as_str());
    index.save(&ctx.storage.steps).await.unwrap();

    doubles.text.fail.store(true, Ordering::SeqCst);
    let result = run(&ctx, StepKind::ExtractText).await;
    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(doubles.text.calls(), 2);

    let index = HashIndex::load(&ctx.storage.steps, &text_step, &index_file).await.unwrap();
    assert_eq!(index.get(&pdf_hash), None);
}
