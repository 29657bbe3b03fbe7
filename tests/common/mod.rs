//! Shared collaborator doubles for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use powerflow::adapters::{
    Collaborators, Downloader, ExternalError, RegexFieldExtractor, Scraper, StructuredExtractor,
    TextExtractor,
};
use powerflow::config::PipelineSettings;
use powerflow::core::{Pipeline, RetryPolicy, StepContext, StepInvocation};
use powerflow::domain::{Lane, Manufacturer, ProductType, Record, StepKind};
use powerflow::storage::Storage;

pub fn recom_dcdc() -> Lane {
    Lane::new(Manufacturer::Recom, ProductType::DcDcConverters)
}

/// Series `S1..Sn`, each with `per_series` products sharing one datasheet
pub struct StubScraper {
    series: Vec<String>,
    per_series: usize,
    failing: HashSet<String>,
    stall_after: Option<usize>,
    pub product_calls: AtomicUsize,
}

impl StubScraper {
    pub fn new(series: usize, per_series: usize) -> Self {
        Self {
            series: (1..=series).map(|i| format!("S{}", i)).collect(),
            per_series,
            failing: HashSet::new(),
            stall_after: None,
            product_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, series: &str) -> Self {
        self.failing.insert(series.to_string());
        self
    }

    /// Hang on every product call after the first `calls`, like a process
    /// that is about to be killed
    pub fn stalling_after(mut self, calls: usize) -> Self {
        self.stall_after = Some(calls);
        self
    }
}

#[async_trait]
impl Scraper for StubScraper {
    async fn scrape_series(&self, _lane: &Lane) -> Result<Vec<Record>, ExternalError> {
        Ok(self
            .series
            .iter()
            .map(|s| {
                Record::new()
                    .with("product_name", s.as_str())
                    .with("product_link", format!("/series/{}", s))
            })
            .collect())
    }

    async fn scrape_products(&self, _lane: &Lane, series: &Record) -> Result<Vec<Record>, ExternalError> {
        let call = self.product_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stall_after.is_some_and(|n| call > n) {
            std::future::pending::<()>().await;
        }
        let name = series.get("product_name").unwrap_or_default().to_string();
        if self.failing.contains(&name) {
            return Err(ExternalError::rejected("scraper", format!("HTTP 404: {}", name)));
        }

        Ok((1..=self.per_series)
            .map(|i| {
                Record::new()
                    .with("part_number", format!("{}-{}", name, i))
                    .with("datasheet_link", format!("/pdf/{}.pdf", name))
                    .with("image_url", format!("/img/{}.png", name))
            })
            .collect())
    }
}

/// Serves `%PDF <url>` for every URL except the failing ones
#[derive(Default)]
pub struct StubDownloader {
    failing: HashSet<String>,
    stall_after: Option<usize>,
    pub calls: AtomicUsize,
}

impl StubDownloader {
    pub fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    /// Hang on every download after the first `calls`
    pub fn stalling_after(mut self, calls: usize) -> Self {
        self.stall_after = Some(calls);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for StubDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ExternalError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stall_after.is_some_and(|n| call > n) {
            std::future::pending::<()>().await;
        }
        if self.failing.contains(url) {
            return Err(ExternalError::rejected("download", "HTTP 404: gone"));
        }
        Ok(format!("%PDF {}", url).into_bytes())
    }
}

/// Echoes the document back with an efficiency line the regex fields pick up
#[derive(Default)]
pub struct StubTextExtractor {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl StubTextExtractor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextExtractor for StubTextExtractor {
    async fn extract_text(&self, document: &[u8]) -> Result<String, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExternalError::rejected("text extraction", "unsupported document"));
        }
        Ok(format!(
            "{}\nEfficiency: 91 %\n",
            String::from_utf8_lossy(document)
        ))
    }
}

/// Returns one valid converter per part number found in the context
#[derive(Default)]
pub struct StubStructuredExtractor {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl StubStructuredExtractor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn part_numbers(context: &Value) -> Vec<String> {
    if let Some(part) = context["common_series_info"]["part_number"].as_str() {
        return vec![part.to_string()];
    }
    context["products"]
        .as_array()
        .map(|products| {
            products
                .iter()
                .filter_map(|p| p["part_number"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn converter(part_number: &str) -> Value {
    json!({
        "part_number": part_number,
        "converter_type": "DC/DC",
        "power": 3.0,
        "efficiency": 91.0,
        "isolation_test_voltage": [{"unit": "VDC", "voltage": 1500}],
        "pins": [],
        "power_derating": []
    })
}

#[async_trait]
impl StructuredExtractor for StubStructuredExtractor {
    async fn extract(&self, _text: &str, context: &Value, _count: usize) -> Result<String, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExternalError::rejected("structured extraction", "HTTP 400: bad request"));
        }
        let parts = part_numbers(context);
        let converters: Vec<Value> = parts.iter().map(|p| converter(p)).collect();
        Ok(json!({
            "part_numbers_to_extract": parts,
            "power_converters": converters,
            "model_notes": "tables read from page 2",
        })
        .to_string())
    }
}

/// The full set of doubles plus handles for assertions
pub struct Doubles {
    pub scraper: Arc<StubScraper>,
    pub downloader: Arc<StubDownloader>,
    pub text: Arc<StubTextExtractor>,
    pub structured: Arc<StubStructuredExtractor>,
}

impl Doubles {
    pub fn new(scraper: StubScraper) -> Self {
        Self::with_downloader(scraper, StubDownloader::default())
    }

    pub fn with_downloader(scraper: StubScraper, downloader: StubDownloader) -> Self {
        Self {
            scraper: Arc::new(scraper),
            downloader: Arc::new(downloader),
            text: Arc::new(StubTextExtractor::default()),
            structured: Arc::new(StubStructuredExtractor::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new()
            .with_scraper(Manufacturer::Recom, self.scraper.clone())
            .with_downloader(self.downloader.clone())
            .with_text_extractor(self.text.clone())
            .with_structured_extractor(self.structured.clone())
            .with_field_extractor(
                Manufacturer::Recom,
                Arc::new(RegexFieldExtractor::for_manufacturer(Manufacturer::Recom)),
            )
    }
}

/// Settings that keep tests fast: a single attempt, small checkpoints
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        checkpoint_interval: 2,
        retry: RetryPolicy::none(),
        ..PipelineSettings::default()
    }
}

pub fn context(storage: Storage, collaborators: Collaborators) -> StepContext {
    context_with(storage, collaborators, test_settings())
}

pub fn context_with(storage: Storage, collaborators: Collaborators, settings: PipelineSettings) -> StepContext {
    StepContext::new(storage, settings, Arc::new(collaborators))
}

/// Invocation of `kind` for `lane` as the standard pipeline names it
pub fn invocation(kind: StepKind, lane: Lane) -> StepInvocation {
    let pipeline = Pipeline::standard();
    let spec = pipeline.spec(kind).cloned().unwrap_or_else(|| panic!("no spec for {}", kind));
    StepInvocation {
        lane,
        step: kind,
        step_name: spec.step_name(lane.manufacturer),
        input_step_name: pipeline.input_name(&spec, lane.manufacturer),
    }
}
